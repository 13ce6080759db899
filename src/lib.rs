//! oxidnn: an inference runtime that compiles a declarative topology of
//! neural-network primitives into a program of JIT-specialised kernels
//! and executes it on a device behind a vendor-neutral seam.
//!
//! The flow mirrors the data model: build a [`Topology`] of
//! [`PrimitiveDesc`]s, compile it against an [`Engine`] into a
//! [`Program`], instantiate a [`Network`], bind inputs and `execute()`.

pub mod engine;
pub mod errors;
pub mod kernels;
pub mod memory;
pub mod network;
pub mod program;
pub mod tensor;
pub mod topology;
pub mod types;

pub use engine::{DeviceType, Engine, EngineConfig, Event};
pub use errors::{last_error_message, record_last_error, take_last_error};
pub use errors::{OxError, OxResult, StatusCode};
pub use memory::Memory;
pub use network::{Network, NetworkOutput};
pub use program::{BuildOptions, Program};
pub use tensor::{Axis, Format, Layout, Padding, TensorShape};
pub use topology::{PrimitiveDesc, PrimitiveKind, Topology};
pub use types::{DataType, PrimitiveId};
