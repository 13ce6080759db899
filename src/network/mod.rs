use std::collections::HashMap;

use tracing::{debug, trace};

use crate::engine::{CompiledKernel, Engine, Event, RuntimeArg};
use crate::errors::{OxError, OxResult};
use crate::kernels::{ArgumentKind, KernelData};
use crate::memory::Memory;
use crate::program::{BuildOptions, Program};
use crate::topology::Topology;
use crate::types::{PrimitiveId, ScalarValue};

/// One network output: its completion event and the memory holding the
/// result once that event completes.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    pub event: Event,
    pub memory: Memory,
}

/// Runtime instance of a program bound to an engine: owns per-node output
/// memories, compiled kernels and the per-execution event table. A network
/// is not safe for concurrent `execute` calls; the event table is
/// rewritten on every run.
#[derive(Debug)]
pub struct Network {
    engine: Engine,
    program: Program,
    memories: Vec<Option<Memory>>,
    events: Vec<Option<Event>>,
    compiled: Vec<Vec<CompiledKernel>>,
    bindings: HashMap<usize, (Memory, Event)>,
}

impl Network {
    /// Compiles the topology and instantiates the result in one step.
    pub fn build(
        engine: &Engine,
        topology: &Topology,
        options: &BuildOptions,
    ) -> OxResult<Network> {
        let program = Program::build(engine, topology, options)?;
        Network::new(engine, program)
    }

    pub fn new(engine: &Engine, program: Program) -> OxResult<Network> {
        // batch-compile every selected kernel up front
        let flat: Vec<&KernelData> = program
            .order()
            .iter()
            .flat_map(|&i| program.node(i).selected.iter())
            .collect();
        let mut compiled_flat = engine.compile_kernels(&flat)?.into_iter();
        let mut compiled: Vec<Vec<CompiledKernel>> = vec![Vec::new(); program.nodes().len()];
        for &i in program.order() {
            for _ in &program.node(i).selected {
                compiled[i].push(compiled_flat.next().expect("one compiled kernel per selected"));
            }
        }

        let memories = allocate_memories(&program)?;
        debug!(
            nodes = program.order().len(),
            inputs = program.input_ids().len(),
            outputs = program.output_ids().len(),
            "network instantiated"
        );
        Ok(Network {
            engine: engine.clone(),
            events: vec![None; program.nodes().len()],
            memories,
            compiled,
            program,
            bindings: HashMap::new(),
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn input_ids(&self) -> Vec<PrimitiveId> {
        self.program.input_ids()
    }

    pub fn output_ids(&self) -> Vec<PrimitiveId> {
        self.program.output_ids()
    }

    /// Binds caller memory to an input whose contents are already valid;
    /// the input's event is pre-signalled.
    pub fn set_input_data(&mut self, id: &str, memory: Memory) -> OxResult<()> {
        let event = self.engine.completed_event();
        self.bind_input(id, memory, event)
    }

    /// Binds caller memory together with an event the caller will signal
    /// once the memory holds valid data.
    pub fn set_input(&mut self, id: &str, memory: Memory, ready: Event) -> OxResult<()> {
        self.bind_input(id, memory, ready)
    }

    fn bind_input(&mut self, id: &str, memory: Memory, ready: Event) -> OxResult<()> {
        let Some(idx) = self.program.index_of(id) else {
            return Err(OxError::InvalidArgument(format!("no primitive named '{id}'")));
        };
        let node = self.program.node(idx);
        if !node.is_input() {
            return Err(OxError::InvalidArgument(format!("primitive '{id}' is not an input")));
        }
        if !memory.layout().compatible(node.output_layout()) {
            return Err(OxError::InvalidArgument(format!(
                "memory layout does not match input '{id}': {:?} vs {:?}",
                memory.layout(),
                node.output_layout()
            )));
        }
        self.bindings.insert(idx, (memory, ready));
        Ok(())
    }

    /// Walks the program in topological order, enqueueing every selected
    /// kernel with dependency events drawn from the graph edges. Returns
    /// the output map {id -> (event, memory)}.
    pub fn execute(&mut self) -> OxResult<HashMap<PrimitiveId, NetworkOutput>> {
        for event in &mut self.events {
            *event = None;
        }

        for &i in self.program.order() {
            let node = self.program.node(i);
            if node.is_input() {
                let Some((memory, ready)) = self.bindings.get(&i) else {
                    return Err(OxError::InvalidArgument(format!(
                        "input '{}' has no bound memory",
                        node.desc.id
                    )));
                };
                self.memories[i] = Some(memory.clone());
                self.events[i] = Some(ready.clone());
                continue;
            }
            if node.is_constant() && node.selected.is_empty() {
                self.events[i] = Some(self.engine.completed_event());
                continue;
            }

            let dep_events: Vec<Event> = node
                .dependencies
                .iter()
                .map(|&d| self.events[d].clone().expect("dependency executed earlier"))
                .collect();

            if node.can_be_optimized {
                trace!(node = %node.desc.id, "optimised node aliases its neighbour");
                self.events[i] = Some(self.engine.group_events(&dep_events)?);
                continue;
            }

            let splits = node.split();
            let enqueues: Vec<(usize, usize)> = if splits > 1 {
                (0..splits).map(|s| (s, 0)).collect()
            } else {
                (0..node.selected.len()).map(|k| (k, k)).collect()
            };

            let mut last = None;
            for (split_idx, kernel_idx) in enqueues {
                let kd = &node.selected[kernel_idx];
                let args = self.bind_arguments(i, kd, split_idx)?;
                let event = self.engine.enqueue_kernel(
                    &self.compiled[i][kernel_idx],
                    kd,
                    args,
                    &dep_events,
                )?;
                last = Some(event);
            }
            self.events[i] = Some(match last {
                Some(event) => event,
                None => self.engine.group_events(&dep_events)?,
            });
        }

        let mut outputs = HashMap::new();
        for &i in self.program.order() {
            let node = self.program.node(i);
            if node.is_output {
                outputs.insert(
                    node.desc.id.clone(),
                    NetworkOutput {
                        event: self.events[i].clone().expect("executed"),
                        memory: self.memories[i].clone().expect("allocated"),
                    },
                );
            }
        }
        Ok(outputs)
    }

    /// Output memory of a node, readable after its event completes.
    pub fn output_memory(&self, id: &str) -> OxResult<Memory> {
        let idx = self
            .program
            .index_of(id)
            .ok_or_else(|| OxError::InvalidArgument(format!("no primitive named '{id}'")))?;
        self.memories[idx]
            .clone()
            .ok_or_else(|| OxError::InvalidArgument(format!("'{id}' has no memory")))
    }

    fn bind_arguments(
        &self,
        node_idx: usize,
        kd: &KernelData,
        split_idx: usize,
    ) -> OxResult<Vec<RuntimeArg>> {
        let node = self.program.node(node_idx);
        let data_inputs = node.data_input_count();
        let splits = node.split();
        let memory_of = |idx: usize| -> OxResult<Memory> {
            self.memories[idx].clone().ok_or_else(|| {
                OxError::InvalidArgument(format!(
                    "'{}' executed before its dependency had memory",
                    node.desc.id
                ))
            })
        };

        let mut args = Vec::with_capacity(kd.arguments.len());
        for arg in &kd.arguments {
            let bound = match arg {
                ArgumentKind::Input(j) => {
                    RuntimeArg::Memory(memory_of(node.dependencies[*j])?)
                }
                ArgumentKind::Output => RuntimeArg::Memory(memory_of(node_idx)?),
                ArgumentKind::Weights => {
                    let memory = match node.reordered_weights.get(split_idx) {
                        Some(m) => m.clone(),
                        None => memory_of(node.dependencies[data_inputs + split_idx])?,
                    };
                    RuntimeArg::Memory(memory)
                }
                ArgumentKind::Bias => RuntimeArg::Memory(memory_of(
                    node.dependencies[data_inputs + splits + split_idx],
                )?),
                ArgumentKind::Scalar(s) => RuntimeArg::Scalar(kd.scalars[*s]),
                ArgumentKind::SplitIndex => {
                    RuntimeArg::Scalar(ScalarValue::U32(split_idx as u32))
                }
            };
            args.push(bound);
        }
        Ok(args)
    }
}

/// Allocates output buffers honouring the aliasing decided at build time:
/// chain roots get real buffers, optimised nodes get layout views into
/// their root's buffer. Inputs stay unallocated until bound.
fn allocate_memories(program: &Program) -> OxResult<Vec<Option<Memory>>> {
    let mut memories: Vec<Option<Memory>> = vec![None; program.nodes().len()];
    for &i in program.order() {
        let node = program.node(i);
        if node.is_input() || node.alias_target.is_some() {
            continue;
        }
        if let Some(constant) = &node.constant {
            memories[i] = Some(constant.clone());
        } else {
            memories[i] = Some(Memory::allocate(node.output_layout().clone())?);
        }
    }
    // alias chains can point forward (concat inputs view the concat
    // buffer), so resolve as a fixpoint
    let mut pending = true;
    while pending {
        pending = false;
        let mut progressed = false;
        for &i in program.order() {
            let node = program.node(i);
            if memories[i].is_some() {
                continue;
            }
            let Some(target) = node.alias_target else { continue };
            // constants substituted at build keep their own storage
            if let Some(root) = &memories[target] {
                memories[i] = Some(root.with_layout(node.output_layout().clone())?);
                progressed = true;
            } else {
                pending = true;
            }
        }
        if pending && !progressed {
            return Err(OxError::InvalidArgument(
                "aliasing cycle in optimised nodes".into(),
            ));
        }
    }
    Ok(memories)
}
