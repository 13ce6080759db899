//! Reference device: executes selected kernels natively on the host,
//! driven by the same jit constants and argument descriptors a real
//! device would receive. Serves as the always-available backend and as
//! the semantic oracle for the test suite.

mod exec;

use std::sync::Arc;
use std::time::Instant;

use crate::engine::device::{DeviceContext, DeviceKernel, DeviceType, KernelSource, RuntimeArg};
use crate::engine::event::{
    Event, ProfilingInterval, INTERVAL_EXECUTING, INTERVAL_QUEUED, INTERVAL_SUBMITTED,
};
use crate::errors::{OxError, OxResult};
use crate::kernels::{source_db, JitConstants};

/// A "compiled" kernel on the reference device: the validated template
/// name plus its jit table, parsed once at compile time.
#[derive(Debug)]
pub struct HostKernel {
    pub template: &'static str,
    pub entry_point: String,
    pub jit: JitConstants,
}

#[derive(Debug, Default)]
pub struct HostDevice;

impl HostDevice {
    pub fn new() -> Self {
        HostDevice
    }
}

impl DeviceContext for HostDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn compile(&self, sources: &[KernelSource]) -> OxResult<Vec<DeviceKernel>> {
        let mut kernels = Vec::with_capacity(sources.len());
        for source in sources {
            if source.is_custom {
                return Err(OxError::NotImplemented(format!(
                    "custom kernel '{}' is not wired for the reference device",
                    source.entry_point
                )));
            }
            // resolving the template is this device's whole compile step
            source_db::get(source.template)?;
            kernels.push(DeviceKernel::Host(Arc::new(HostKernel {
                template: source.template,
                entry_point: source.entry_point.clone(),
                jit: source.jit.clone(),
            })));
        }
        Ok(kernels)
    }

    fn enqueue(
        &self,
        kernel: &DeviceKernel,
        _gws: [usize; 3],
        _lws: Option<[usize; 3]>,
        args: &[RuntimeArg],
        wait_for: &[Event],
        profile: bool,
        stamp: u64,
    ) -> OxResult<Event> {
        let kernel = match kernel {
            DeviceKernel::Host(kernel) => kernel,
            #[cfg(feature = "opencl")]
            _ => {
                return Err(OxError::DeviceError("kernel compiled for another device".into()));
            }
        };
        let queued = Instant::now();
        // the reference queue is synchronous: dependencies drain here, so
        // user events must be set before execution reaches this kernel
        for dep in wait_for {
            dep.wait();
        }
        let started = Instant::now();
        exec::run(kernel, args)?;
        let event = Event::completed(stamp);
        if profile {
            event.complete(Some(vec![
                ProfilingInterval { name: INTERVAL_QUEUED, nanoseconds: 0 },
                ProfilingInterval {
                    name: INTERVAL_SUBMITTED,
                    nanoseconds: (started - queued).as_nanos() as u64,
                },
                ProfilingInterval {
                    name: INTERVAL_EXECUTING,
                    nanoseconds: started.elapsed().as_nanos() as u64,
                },
            ]));
        }
        Ok(event)
    }

    fn enqueue_barrier(&self, wait_for: &[Event], stamp: u64) -> OxResult<Event> {
        for dep in wait_for {
            dep.wait();
        }
        Ok(Event::completed(stamp))
    }
}
