pub mod device;
pub mod event;
pub mod host;
#[cfg(feature = "opencl")]
pub mod ocl;

pub use device::{DeviceContext, DeviceKernel, DeviceType, KernelSource, RuntimeArg};
pub use event::{Event, ProfilingInterval};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::errors::{OxError, OxResult};
use crate::kernels::{source_db, KernelData};
use crate::memory::{Element, Memory};
use crate::tensor::Layout;

/// Engine construction options; mirrors the embedder-visible table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub enable_profiling: bool,
    pub meaningful_kernel_names: bool,
    pub device_type: DeviceType,
    /// 32-bit vendor filter; 0 accepts any vendor.
    pub device_vendor: u32,
    pub compiler_options: String,
    /// Amortise dependency tracking with queue stamps and host barriers
    /// instead of per-kernel wait lists.
    pub host_out_of_order: bool,
    /// Debug harness: run only the kernel with this entry point, skip the
    /// rest.
    pub single_kernel_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_profiling: false,
            meaningful_kernel_names: false,
            device_type: DeviceType::Default,
            device_vendor: 0,
            compiler_options: String::new(),
            host_out_of_order: false,
            single_kernel_name: None,
        }
    }
}

/// A compiled kernel handle returned by the engine's cache.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub(crate) kernel: DeviceKernel,
}

#[derive(Debug, Default)]
struct QueueState {
    next_stamp: u64,
    last_barrier_stamp: u64,
    barrier: Option<Event>,
}

#[derive(Debug)]
struct EngineInner {
    device: Box<dyn DeviceContext>,
    config: EngineConfig,
    // keyed on full source text + compiler options
    cache: Mutex<HashMap<String, DeviceKernel>>,
    queue: Mutex<QueueState>,
}

/// Owner of a device context, kernel cache and command queue. Cloning is
/// cheap and shares all three.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine backed by the always-available reference device.
    pub fn host(config: EngineConfig) -> Engine {
        Engine::with_device(Box::new(host::HostDevice::new()), config)
    }

    /// Engine backed by an OpenCL device honouring the config's device
    /// type and vendor filter.
    #[cfg(feature = "opencl")]
    pub fn opencl(config: EngineConfig) -> OxResult<Engine> {
        let device = ocl::OclDevice::open(&config)?;
        Ok(Engine::with_device(Box::new(device), config))
    }

    pub fn with_device(device: Box<dyn DeviceContext>, config: EngineConfig) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                device,
                config,
                cache: Mutex::new(HashMap::new()),
                queue: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.device.device_type()
    }

    /// Allocates a zero-initialised device buffer for the layout.
    pub fn allocate(&self, layout: Layout) -> OxResult<Memory> {
        Memory::allocate(layout)
    }

    /// Wraps caller-supplied data as a memory object; the layout decides
    /// how kernels index it.
    pub fn attach<T: Element>(&self, layout: Layout, data: &[T]) -> OxResult<Memory> {
        Memory::attach(layout, data)
    }

    pub fn create_user_event(&self) -> Event {
        self.inner.device.create_user_event()
    }

    pub fn wait(&self, events: &[Event]) -> OxResult<()> {
        self.inner.device.wait(events)
    }

    /// Assembles the compilable source for a selected kernel: jit prefix,
    /// shared helper header, then the template (or user source).
    pub(crate) fn assemble_source(&self, data: &KernelData) -> OxResult<KernelSource> {
        let body = match &data.custom_source {
            Some(src) => src.clone(),
            None => source_db::with_header(source_db::get(data.template)?),
        };
        let code = format!("{}{}", data.jit.to_source_prefix(), body);
        Ok(KernelSource {
            template: data.template,
            code,
            entry_point: data.entry_point.clone(),
            options: self.inner.config.compiler_options.clone(),
            batch_compilation: data.custom_source.is_none(),
            jit: data.jit.clone(),
            is_custom: data.custom_source.is_some(),
        })
    }

    /// Compiles a set of kernels, batching sources that share compiler
    /// options and the batch-compilation bit, and consulting the cache
    /// before touching the device compiler.
    pub(crate) fn compile_kernels(&self, kernels: &[&KernelData]) -> OxResult<Vec<CompiledKernel>> {
        let sources: Vec<KernelSource> =
            kernels.iter().map(|kd| self.assemble_source(kd)).collect::<OxResult<_>>()?;

        let mut cache = self.inner.cache.lock().expect("kernel cache poisoned");
        let mut out: Vec<Option<CompiledKernel>> = vec![None; kernels.len()];
        // (options, batch bit) -> positions awaiting compilation
        let mut batches: HashMap<(String, bool), Vec<usize>> = HashMap::new();
        for (i, source) in sources.iter().enumerate() {
            let key = format!("{}\u{1}{}", source.options, source.code);
            if let Some(kernel) = cache.get(&key) {
                trace!(entry = %source.entry_point, "kernel cache hit");
                out[i] = Some(CompiledKernel { kernel: kernel.clone() });
            } else {
                batches
                    .entry((source.options.clone(), source.batch_compilation))
                    .or_default()
                    .push(i);
            }
        }

        for ((options, batched), positions) in batches {
            debug!(
                count = positions.len(),
                batched,
                options = options.as_str(),
                "compiling kernel batch"
            );
            let batch: Vec<KernelSource> =
                positions.iter().map(|&i| sources[i].clone()).collect();
            let compiled = self.inner.device.compile(&batch)?;
            for (&i, kernel) in positions.iter().zip(compiled) {
                let key = format!("{}\u{1}{}", sources[i].options, sources[i].code);
                cache.insert(key, kernel.clone());
                out[i] = Some(CompiledKernel { kernel });
            }
        }

        Ok(out.into_iter().map(|k| k.expect("every kernel resolved")).collect())
    }

    /// An already-complete event, used for constants and pre-valid inputs.
    pub(crate) fn completed_event(&self) -> Event {
        let queue = self.inner.queue.lock().expect("queue state poisoned");
        Event::completed(queue.next_stamp)
    }

    /// Merges dependency events into a single marker event without running
    /// a kernel; optimised-out nodes use this as their completion.
    pub(crate) fn group_events(&self, deps: &[Event]) -> OxResult<Event> {
        if deps.iter().all(|e| e.is_completed()) {
            return Ok(self.completed_event());
        }
        if let [single] = deps {
            return Ok(single.clone());
        }
        let stamp = {
            let mut queue = self.inner.queue.lock().expect("queue state poisoned");
            queue.next_stamp += 1;
            queue.next_stamp
        };
        self.inner.device.enqueue_barrier(deps, stamp)
    }

    /// Enqueues one kernel execution with its dependency events, applying
    /// the engine's submission mode.
    pub(crate) fn enqueue_kernel(
        &self,
        compiled: &CompiledKernel,
        data: &KernelData,
        args: Vec<RuntimeArg>,
        deps: &[Event],
    ) -> OxResult<Event> {
        if let Some(only) = &self.inner.config.single_kernel_name {
            if &data.entry_point != only {
                trace!(entry = %data.entry_point, "skipped by single_kernel_name");
                return Ok(self.completed_event());
            }
        }

        let (stamp, wait_list) = {
            let mut queue = self.inner.queue.lock().expect("queue state poisoned");
            queue.next_stamp += 1;
            let stamp = queue.next_stamp;

            if self.inner.config.host_out_of_order {
                // user events are outside the queue and always waited on
                // explicitly; queue events are covered by barriers
                let user: Vec<Event> = deps.iter().filter(|e| e.is_user()).cloned().collect();
                let newest = deps
                    .iter()
                    .filter(|e| !e.is_user())
                    .map(|e| e.stamp())
                    .max()
                    .unwrap_or(0);
                if newest > queue.last_barrier_stamp {
                    let queue_deps: Vec<Event> =
                        deps.iter().filter(|e| !e.is_user()).cloned().collect();
                    let barrier = self.inner.device.enqueue_barrier(&queue_deps, stamp)?;
                    queue.last_barrier_stamp = newest;
                    queue.barrier = Some(barrier);
                }
                let mut wait_list = user;
                if let Some(barrier) = &queue.barrier {
                    wait_list.push(barrier.clone());
                }
                (stamp, wait_list)
            } else {
                (stamp, deps.to_vec())
            }
        };

        self.inner.device.enqueue(
            &compiled.kernel,
            data.gws,
            data.lws,
            &args,
            &wait_list,
            self.inner.config.enable_profiling,
            stamp,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::jit::{base_jit, gws_per_element};
    use crate::kernels::{ArgumentKind, BaseParams};
    use crate::tensor::{Format, TensorShape};
    use crate::types::DataType;

    fn relu_kernel(layout: &Layout) -> KernelData {
        let base = BaseParams::new(vec![layout.clone()], layout.clone())
            .with_activation(Some(crate::topology::ActivationInfo::relu()));
        let mut kd = KernelData::new("activation_ref", "activation_ref");
        kd.jit = base_jit(&base);
        kd.gws = gws_per_element(layout);
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd
    }

    #[test]
    fn compile_enqueue_round_trip() {
        let engine = Engine::host(EngineConfig::default());
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 1, 1, 4));
        let kd = relu_kernel(&layout);
        let compiled = engine.compile_kernels(&[&kd]).unwrap();

        let input = engine.allocate(layout.clone()).unwrap();
        input.write_all(&[-1.0f32, 2.0, -3.0, 4.0]).unwrap();
        let output = engine.allocate(layout).unwrap();

        let event = engine
            .enqueue_kernel(
                &compiled[0],
                &kd,
                vec![RuntimeArg::Memory(input), RuntimeArg::Memory(output.clone())],
                &[],
            )
            .unwrap();
        engine.wait(&[event]).unwrap();
        assert_eq!(output.read_to_vec::<f32>().unwrap(), vec![0.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn cache_hits_on_identical_source() {
        let engine = Engine::host(EngineConfig::default());
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 1, 1, 4));
        let kd = relu_kernel(&layout);
        engine.compile_kernels(&[&kd]).unwrap();
        // second compile of the same source resolves from the cache
        engine.compile_kernels(&[&kd, &kd]).unwrap();
    }

    #[test]
    fn single_kernel_name_skips_other_kernels() {
        let config = EngineConfig {
            single_kernel_name: Some("something_else".into()),
            ..Default::default()
        };
        let engine = Engine::host(config);
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 1, 1, 2));
        let kd = relu_kernel(&layout);
        let compiled = engine.compile_kernels(&[&kd]).unwrap();
        let input = engine.allocate(layout.clone()).unwrap();
        input.write_all(&[-5.0f32, 5.0]).unwrap();
        let output = engine.allocate(layout).unwrap();
        let event = engine
            .enqueue_kernel(
                &compiled[0],
                &kd,
                vec![RuntimeArg::Memory(input), RuntimeArg::Memory(output.clone())],
                &[],
            )
            .unwrap();
        assert!(event.is_completed());
        // kernel was skipped, output untouched
        assert_eq!(output.read_to_vec::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn profiling_intervals_present_when_enabled() {
        let config = EngineConfig { enable_profiling: true, ..Default::default() };
        let engine = Engine::host(config);
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 1, 1, 2));
        let kd = relu_kernel(&layout);
        let compiled = engine.compile_kernels(&[&kd]).unwrap();
        let input = engine.allocate(layout.clone()).unwrap();
        let output = engine.allocate(layout).unwrap();
        let event = engine
            .enqueue_kernel(
                &compiled[0],
                &kd,
                vec![RuntimeArg::Memory(input), RuntimeArg::Memory(output)],
                &[],
            )
            .unwrap();
        let intervals = event.profiling_intervals().expect("profiling enabled");
        assert_eq!(intervals.len(), 3);
    }
}
