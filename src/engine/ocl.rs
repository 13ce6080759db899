//! OpenCL device behind the `opencl` feature: compiles the emitted CL
//! sources and enqueues on a real command queue. Memory stays host-backed;
//! buffers are staged around each enqueue, which trades bandwidth for a
//! single ownership model across devices.

use std::sync::{Arc, Mutex};

use ocl::{Buffer, Context, Device, Kernel, Platform, Program, Queue};

use crate::engine::device::{DeviceContext, DeviceKernel, DeviceType, KernelSource, RuntimeArg};
use crate::engine::event::{
    Event, ProfilingInterval, INTERVAL_EXECUTING, INTERVAL_QUEUED, INTERVAL_SUBMITTED,
};
use crate::engine::EngineConfig;
use crate::errors::{OxError, OxResult};
use crate::types::ScalarValue;

#[derive(Debug)]
pub struct OclKernel {
    kernel: Mutex<Kernel>,
}

pub struct OclDevice {
    context: Context,
    queue: Queue,
    device: Device,
    device_type: DeviceType,
}

impl std::fmt::Debug for OclDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OclDevice").field("device", &self.device.name().ok()).finish()
    }
}

fn cl_err(e: ocl::Error) -> OxError {
    OxError::DeviceError(e.to_string())
}

impl OclDevice {
    /// Opens the first device matching the configured type and vendor.
    pub fn open(config: &EngineConfig) -> OxResult<OclDevice> {
        let wanted = match config.device_type {
            DeviceType::Default | DeviceType::Gpu => ocl::flags::DEVICE_TYPE_GPU,
            DeviceType::Cpu => ocl::flags::DEVICE_TYPE_CPU,
            DeviceType::Accelerator => ocl::flags::DEVICE_TYPE_ACCELERATOR,
        };
        for platform in Platform::list() {
            let devices = Device::list(platform, Some(wanted)).map_err(cl_err)?;
            for device in devices {
                if config.device_vendor != 0 {
                    let vendor = device
                        .info(ocl::enums::DeviceInfo::VendorId)
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    if vendor != config.device_vendor.to_string() {
                        continue;
                    }
                }
                let context = Context::builder()
                    .platform(platform)
                    .devices(device)
                    .build()
                    .map_err(cl_err)?;
                let queue = Queue::new(&context, device, None).map_err(cl_err)?;
                return Ok(OclDevice {
                    context,
                    queue,
                    device,
                    device_type: config.device_type,
                });
            }
        }
        Err(OxError::DeviceError("no OpenCL device matches the configuration".into()))
    }

    fn stage_in(&self, mem: &crate::memory::Memory) -> OxResult<Buffer<u8>> {
        let bytes = mem.copy_to_bytes();
        Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .len(bytes.len().max(1))
            .copy_host_slice(&bytes)
            .build()
            .map_err(cl_err)
    }
}

impl DeviceContext for OclDevice {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn compile(&self, sources: &[KernelSource]) -> OxResult<Vec<DeviceKernel>> {
        let mut kernels = Vec::with_capacity(sources.len());
        for source in sources {
            let program = Program::builder()
                .devices(self.device)
                .cmplr_opt(source.options.clone())
                .src(source.code.clone())
                .build(&self.context)
                .map_err(|e| OxError::CompileError { log: e.to_string() })?;
            let kernel = Kernel::builder()
                .program(&program)
                .name(source.entry_point.clone())
                .queue(self.queue.clone())
                .build()
                .map_err(|e| OxError::CompileError { log: e.to_string() })?;
            kernels.push(DeviceKernel::Ocl(Arc::new(OclKernel { kernel: Mutex::new(kernel) })));
        }
        Ok(kernels)
    }

    fn enqueue(
        &self,
        kernel: &DeviceKernel,
        gws: [usize; 3],
        lws: Option<[usize; 3]>,
        args: &[RuntimeArg],
        wait_for: &[Event],
        profile: bool,
        stamp: u64,
    ) -> OxResult<Event> {
        let DeviceKernel::Ocl(kernel) = kernel else {
            return Err(OxError::DeviceError("kernel compiled for another device".into()));
        };
        let queued = std::time::Instant::now();
        for dep in wait_for {
            dep.wait();
        }
        let started = std::time::Instant::now();

        let guard = kernel.kernel.lock().expect("kernel poisoned");
        let mut staged: Vec<(Buffer<u8>, crate::memory::Memory)> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            match arg {
                RuntimeArg::Memory(mem) => {
                    let buffer = self.stage_in(mem)?;
                    guard.set_arg(i as u32, &buffer).map_err(cl_err)?;
                    staged.push((buffer, mem.clone()));
                }
                RuntimeArg::Scalar(ScalarValue::U32(v)) => {
                    guard.set_arg(i as u32, v).map_err(cl_err)?
                }
                RuntimeArg::Scalar(ScalarValue::I32(v)) => {
                    guard.set_arg(i as u32, v).map_err(cl_err)?
                }
                RuntimeArg::Scalar(ScalarValue::F32(v)) => {
                    guard.set_arg(i as u32, v).map_err(cl_err)?
                }
            }
        }

        let mut cmd = guard.cmd().global_work_size(gws);
        if let Some(lws) = lws {
            cmd = cmd.local_work_size(lws);
        }
        unsafe { cmd.enq().map_err(cl_err)? };
        self.queue.finish().map_err(cl_err)?;

        // read every staged buffer back; inputs come home unchanged
        for (buffer, mem) in &staged {
            let mut bytes = vec![0u8; mem.byte_len()];
            buffer.read(&mut bytes).enq().map_err(cl_err)?;
            mem.copy_from_bytes(&bytes);
        }

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
        self.queue.finish().map_err(cl_err)?;
        Ok(Event::completed(stamp))
    }
}
