use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::event::Event;
use crate::errors::OxResult;
use crate::kernels::JitConstants;
use crate::memory::Memory;
use crate::types::ScalarValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceType {
    #[default]
    Default,
    Cpu,
    Gpu,
    Accelerator,
}

/// A kernel ready for device compilation: assembled source (jit prefix,
/// shared header, template body) plus the metadata the device needs to
/// group and cache compilations.
#[derive(Debug, Clone)]
pub struct KernelSource {
    pub template: &'static str,
    pub code: String,
    pub entry_point: String,
    pub options: String,
    /// Sources sharing options and this bit compile as one batch.
    pub batch_compilation: bool,
    /// Carried alongside so the reference device can parameterise its
    /// native execution the same way a real device reads the macros.
    pub jit: JitConstants,
    pub is_custom: bool,
}

/// A runtime object bound to one kernel argument slot.
#[derive(Debug, Clone)]
pub enum RuntimeArg {
    Memory(Memory),
    Scalar(ScalarValue),
}

/// Device-side compiled kernel handle.
#[derive(Debug, Clone)]
pub enum DeviceKernel {
    Host(Arc<crate::engine::host::HostKernel>),
    #[cfg(feature = "opencl")]
    Ocl(Arc<crate::engine::ocl::OclKernel>),
}

/// Capability surface the core consumes instead of a vendor API: compile
/// kernel sources, enqueue with dependencies, create events, block.
pub trait DeviceContext: Send + Sync + std::fmt::Debug {
    fn device_type(&self) -> DeviceType;

    /// Compiles a batch of sources that share compiler options. Returns
    /// one kernel per source, in order.
    fn compile(&self, sources: &[KernelSource]) -> OxResult<Vec<DeviceKernel>>;

    /// Enqueues one kernel execution after `wait_for`. The stamp records
    /// the engine's queue position for out-of-order dependency tracking.
    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &self,
        kernel: &DeviceKernel,
        gws: [usize; 3],
        lws: Option<[usize; 3]>,
        args: &[RuntimeArg],
        wait_for: &[Event],
        profile: bool,
        stamp: u64,
    ) -> OxResult<Event>;

    /// Enqueues a queue barrier covering everything submitted so far.
    fn enqueue_barrier(&self, wait_for: &[Event], stamp: u64) -> OxResult<Event>;

    fn create_user_event(&self) -> Event {
        Event::user()
    }

    fn wait(&self, events: &[Event]) -> OxResult<()> {
        for event in events {
            event.wait();
        }
        Ok(())
    }
}
