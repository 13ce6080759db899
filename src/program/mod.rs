mod layout;
mod passes;
mod select;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::Engine;
use crate::errors::{OxError, OxResult};
use crate::kernels::{KernelData, KernelRunner};
use crate::memory::Memory;
use crate::tensor::Layout;
use crate::topology::{PrimitiveDesc, PrimitiveKind, Topology};
use crate::types::PrimitiveId;

/// Options controlling program compilation.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Enable in-place optimisations, fusion and redundant-reorder removal.
    pub optimize_data: bool,
    /// Disable optimisations and keep per-node distinct buffers.
    pub debug: bool,
    /// Primitive ids exposed as network outputs; empty exposes every leaf.
    pub outputs: Vec<PrimitiveId>,
    /// Write compiled kernel sources and a manifest to this directory.
    pub dump_custom_program: Option<PathBuf>,
    /// On-device tuning oracle consulted during kernel selection.
    #[serde(skip)]
    pub tuning: Option<Arc<dyn KernelRunner>>,
}

impl std::fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOptions")
            .field("optimize_data", &self.optimize_data)
            .field("debug", &self.debug)
            .field("outputs", &self.outputs)
            .field("dump_custom_program", &self.dump_custom_program)
            .field("tuning", &self.tuning.is_some())
            .finish()
    }
}

/// The compiled form of one primitive: its description, resolved output
/// layout, dependency edges, and the kernels selected for it. Edges are
/// arena indices, so optimisation passes can splice nodes without
/// ownership cycles.
#[derive(Debug, Clone)]
pub struct ProgramNode {
    pub desc: PrimitiveDesc,
    pub(crate) output_layout: Option<Layout>,
    pub dependencies: Vec<usize>,
    pub users: Vec<usize>,
    /// No kernel runs; the node aliases its neighbour's memory.
    pub can_be_optimized: bool,
    /// Node whose buffer this node's output memory views.
    pub alias_target: Option<usize>,
    /// Constant payload: data primitives and build-time generated tensors.
    pub constant: Option<Memory>,
    /// Weights transformed at build time, one per split, when the selected
    /// kernel demanded a different weights layout.
    pub reordered_weights: Vec<Memory>,
    /// Kernels to enqueue, in order: one per split, or one per
    /// concatenation input. Empty for no-kernel nodes.
    pub selected: Vec<KernelData>,
    pub is_output: bool,
    pub(crate) removed: bool,
}

impl ProgramNode {
    fn new(desc: PrimitiveDesc) -> Self {
        let constant = match &desc.kind {
            PrimitiveKind::Data(p) => Some(p.memory.clone()),
            _ => None,
        };
        ProgramNode {
            desc,
            output_layout: None,
            dependencies: Vec::new(),
            users: Vec::new(),
            can_be_optimized: false,
            alias_target: None,
            constant,
            reordered_weights: Vec::new(),
            selected: Vec::new(),
            is_output: false,
            removed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.desc.id
    }

    pub fn output_layout(&self) -> &Layout {
        self.output_layout.as_ref().expect("layout resolved during build")
    }

    pub fn is_input(&self) -> bool {
        matches!(self.desc.kind, PrimitiveKind::InputLayout(_))
    }

    /// Nodes whose value exists before execution starts.
    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }

    /// Count of visible data inputs; hidden tensor dependencies (weights,
    /// bias, mean, scale) follow them in `dependencies`.
    pub fn data_input_count(&self) -> usize {
        self.desc.inputs.len()
    }

    pub fn split(&self) -> usize {
        self.desc.kind.split()
    }
}

/// Working state shared by the build passes.
pub(crate) struct Builder {
    pub nodes: Vec<ProgramNode>,
    pub by_id: HashMap<PrimitiveId, usize>,
    pub order: Vec<usize>,
}

impl Builder {
    pub fn layout(&self, idx: usize) -> &Layout {
        self.nodes[idx].output_layout()
    }

    pub fn rebuild_users(&mut self) {
        for node in &mut self.nodes {
            node.users.clear();
        }
        for i in 0..self.nodes.len() {
            if self.nodes[i].removed {
                continue;
            }
            for d in self.nodes[i].dependencies.clone() {
                self.nodes[d].users.push(i);
            }
        }
    }

    /// Registers a synthesized node (an inserted reorder) and returns its
    /// index. The caller wires the edges.
    pub fn insert_node(&mut self, desc: PrimitiveDesc, layout: Layout, dep: usize) -> usize {
        let idx = self.nodes.len();
        self.by_id.insert(desc.id.clone(), idx);
        let mut node = ProgramNode::new(desc);
        node.output_layout = Some(layout);
        node.dependencies = vec![dep];
        self.nodes.push(node);
        idx
    }
}

/// Topologically ordered, layout-resolved, kernel-selected program.
#[derive(Debug)]
pub struct Program {
    nodes: Vec<ProgramNode>,
    by_id: HashMap<PrimitiveId, usize>,
    order: Vec<usize>,
    options: BuildOptions,
}

impl Program {
    /// Runs the build pipeline: materialise, sort, propagate layouts,
    /// insert reorders, propagate padding, optimise, select kernels.
    /// Selection can splice further reorders in when a winning candidate
    /// requests its input through a different format. The program is only
    /// published when every pass succeeds.
    pub fn build(engine: &Engine, topology: &Topology, options: &BuildOptions) -> OxResult<Program> {
        let mut b = materialize(topology, options)?;
        b.order = toposort(&b.nodes)?;
        layout::propagate(&mut b)?;
        passes::insert_reorders(&mut b)?;
        b.order = toposort(&b.nodes)?;
        passes::propagate_padding(&mut b)?;
        if options.optimize_data && !options.debug {
            passes::remove_redundant_reorders(&mut b)?;
            passes::optimize_in_place(&mut b)?;
        }
        select::select_kernels(&mut b, engine, options)?;
        b.order = toposort(&b.nodes)?;
        debug!(
            nodes = b.nodes.len(),
            scheduled = b.order.len(),
            "program build finished"
        );
        Ok(Program { nodes: b.nodes, by_id: b.by_id, order: b.order, options: options.clone() })
    }

    pub fn nodes(&self) -> &[ProgramNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &ProgramNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied().filter(|&i| !self.nodes[i].removed)
    }

    /// Execution order; every dependency precedes its users.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn input_ids(&self) -> Vec<PrimitiveId> {
        self.order
            .iter()
            .filter(|&&i| self.nodes[i].is_input())
            .map(|&i| self.nodes[i].desc.id.clone())
            .collect()
    }

    pub fn output_ids(&self) -> Vec<PrimitiveId> {
        self.order
            .iter()
            .filter(|&&i| self.nodes[i].is_output)
            .map(|&i| self.nodes[i].desc.id.clone())
            .collect()
    }
}

fn materialize(topology: &Topology, options: &BuildOptions) -> OxResult<Builder> {
    let mut by_id: HashMap<PrimitiveId, usize> = HashMap::new();
    let mut nodes: Vec<ProgramNode> = Vec::with_capacity(topology.len());
    for desc in topology.iter() {
        by_id.insert(desc.id.clone(), nodes.len());
        nodes.push(ProgramNode::new(desc.clone()));
    }

    for i in 0..nodes.len() {
        let deps = nodes[i].desc.dependencies();
        let mut edges = Vec::with_capacity(deps.len());
        for dep in deps {
            let Some(&idx) = by_id.get(&dep) else {
                return Err(OxError::InvalidArgument(format!(
                    "primitive '{}' references unknown input '{}'",
                    nodes[i].desc.id, dep
                )));
            };
            edges.push(idx);
        }
        nodes[i].dependencies = edges;
    }

    let mut b = Builder { nodes, by_id, order: Vec::new() };
    b.rebuild_users();

    if options.outputs.is_empty() {
        for node in &mut b.nodes {
            node.is_output = node.users.is_empty();
        }
    } else {
        for id in &options.outputs {
            let Some(&idx) = b.by_id.get(id) else {
                return Err(OxError::InvalidArgument(format!(
                    "requested output '{id}' is not part of the topology"
                )));
            };
            b.nodes[idx].is_output = true;
        }
    }
    Ok(b)
}

/// Kahn's algorithm over live nodes; reports a primitive on any cycle.
pub(crate) fn toposort(nodes: &[ProgramNode]) -> OxResult<Vec<usize>> {
    let mut indegree = vec![0usize; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        if node.removed {
            continue;
        }
        for &d in &node.dependencies {
            if nodes[d].removed {
                return Err(OxError::InvalidArgument(format!(
                    "primitive '{}' depends on removed node '{}'",
                    node.desc.id, nodes[d].desc.id
                )));
            }
            indegree[i] += 1;
        }
    }
    let mut ready: Vec<usize> = (0..nodes.len())
        .filter(|&i| !nodes[i].removed && indegree[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    let mut users: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        if node.removed {
            continue;
        }
        for &d in &node.dependencies {
            users[d].push(i);
        }
    }
    while let Some(i) = ready.pop() {
        order.push(i);
        for &u in &users[i] {
            indegree[u] -= 1;
            if indegree[u] == 0 {
                ready.push(u);
            }
        }
    }
    let live = nodes.iter().filter(|n| !n.removed).count();
    if order.len() != live {
        let stuck = (0..nodes.len())
            .find(|&i| !nodes[i].removed && indegree[i] > 0)
            .map(|i| nodes[i].desc.id.clone())
            .unwrap_or_default();
        return Err(OxError::InvalidArgument(format!(
            "topology contains a cycle involving primitive '{stuck}'"
        )));
    }
    Ok(order)
}
