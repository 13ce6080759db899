//! Structural build passes: reorder insertion, redundant-reorder removal,
//! padding propagation and the in-place optimisations.

use tracing::debug;

use crate::errors::OxResult;
use crate::program::Builder;
use crate::tensor::{Axis, Format, Layout, Padding, TensorShape};
use crate::topology::{PrimitiveDesc, PrimitiveKind, ReorderParams, ReorderSubtract};

/// Format a consumer requires for one of its visible inputs, or `None`
/// when the producer's format is acceptable as-is.
fn required_input_format(b: &Builder, node: usize, pos: usize) -> Option<Format> {
    let consumer = &b.nodes[node];
    let dep_format = b.layout(consumer.dependencies[pos]).format;
    // every kernel family consumes simple permutations; blocked data
    // must come through an explicit reorder first
    if !dep_format.is_simple() || dep_format.is_weights() {
        return Some(Format::Bfyx);
    }
    match &consumer.desc.kind {
        PrimitiveKind::Eltwise(_) | PrimitiveKind::Concatenation(_) if pos > 0 => {
            let first = b.layout(consumer.dependencies[0]).format;
            if dep_format != first {
                Some(first)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Inserts explicit reorder nodes wherever a consumer's required input
/// format differs from the producer's output format. This pass covers the
/// structural rules every kernel family shares; transforms requested by a
/// specific winning candidate are injected later, during selection.
pub(crate) fn insert_reorders(b: &mut Builder) -> OxResult<()> {
    for i in b.order.clone() {
        if b.nodes[i].removed {
            continue;
        }
        for pos in 0..b.nodes[i].data_input_count() {
            let Some(required) = required_input_format(b, i, pos) else { continue };
            let dep = b.nodes[i].dependencies[pos];
            let dep_layout = b.layout(dep).clone();
            let target = dep_layout.transform(required);
            let id = format!("{}_input{}_reorder", b.nodes[i].desc.id, pos);
            debug!(
                consumer = %b.nodes[i].desc.id,
                from = dep_layout.format.tag(),
                to = required.tag(),
                "inserting reorder"
            );
            let desc = PrimitiveDesc::new(
                id,
                PrimitiveKind::Reorder(ReorderParams {
                    output_layout: target.clone(),
                    subtract: ReorderSubtract::None,
                }),
                vec![b.nodes[dep].desc.id.clone()],
            );
            let inserted = b.insert_node(desc, target, dep);
            b.nodes[i].dependencies[pos] = inserted;
        }
    }
    b.rebuild_users();
    Ok(())
}

/// Removes pairs of reorders with inverse effect: the second reorder's
/// output matches the first one's input, so both drop out of the graph.
pub(crate) fn remove_redundant_reorders(b: &mut Builder) -> OxResult<()> {
    let mut changed = true;
    while changed {
        changed = false;
        for r2 in 0..b.nodes.len() {
            if b.nodes[r2].removed || b.nodes[r2].is_output {
                continue;
            }
            let PrimitiveKind::Reorder(p2) = &b.nodes[r2].desc.kind else { continue };
            if !matches!(p2.subtract, ReorderSubtract::None) {
                continue;
            }
            let r1 = b.nodes[r2].dependencies[0];
            if b.nodes[r1].removed || b.nodes[r1].is_output || b.nodes[r1].users.len() != 1 {
                continue;
            }
            let PrimitiveKind::Reorder(p1) = &b.nodes[r1].desc.kind else { continue };
            if !matches!(p1.subtract, ReorderSubtract::None) {
                continue;
            }
            let source = b.nodes[r1].dependencies[0];
            let src_layout = b.layout(source);
            let out_layout = b.layout(r2);
            if src_layout.format != out_layout.format
                || src_layout.data_type != out_layout.data_type
                || src_layout.padding != out_layout.padding
            {
                continue;
            }
            debug!(
                first = %b.nodes[r1].desc.id,
                second = %b.nodes[r2].desc.id,
                "removing inverse reorder pair"
            );
            for user in b.nodes[r2].users.clone() {
                for dep in &mut b.nodes[user].dependencies {
                    if *dep == r2 {
                        *dep = source;
                    }
                }
            }
            b.nodes[r1].removed = true;
            b.nodes[r2].removed = true;
            b.rebuild_users();
            changed = true;
        }
    }
    Ok(())
}

/// Grows producers' output padding where a consumer reads outside the
/// logical region (negative input offsets), instead of inserting padding
/// kernels. External inputs and constants cannot be grown; their kernels
/// fall back to bounds checks.
pub(crate) fn propagate_padding(b: &mut Builder) -> OxResult<()> {
    for i in b.order.clone() {
        let node = &b.nodes[i];
        if node.removed {
            continue;
        }
        let offset = match &node.desc.kind {
            PrimitiveKind::Convolution(p) => p.input_offset,
            PrimitiveKind::Pooling(p) => p.input_offset,
            _ => continue,
        };
        let needed = Padding::spatial((-offset.0).max(0) as usize, (-offset.1).max(0) as usize);
        if needed.is_zero() {
            continue;
        }
        let producer = node.dependencies[0];
        if b.nodes[producer].is_input() || b.nodes[producer].is_constant() {
            continue;
        }
        if !b.layout(producer).simple() {
            continue;
        }
        let layout = b.nodes[producer].output_layout.as_mut().expect("layout resolved");
        layout.padding = layout.padding.max(&needed);
    }
    Ok(())
}

fn alias_window(dep_layout: &Layout, size: TensorShape, offsets: TensorShape) -> Layout {
    let upper = TensorShape::new(
        dep_layout.size.batch - offsets.batch - size.batch,
        dep_layout.size.feature - offsets.feature - size.feature,
        dep_layout.size.y - offsets.y - size.y,
        dep_layout.size.x - offsets.x - size.x,
    );
    Layout {
        data_type: dep_layout.data_type,
        format: dep_layout.format,
        size,
        padding: Padding::new(offsets, upper),
    }
}

/// In-place optimisations: identity reorders, reshape views, crop
/// sub-windows and concatenations whose inputs can write straight into
/// the joint buffer. Optimised nodes run no kernel and alias memory.
pub(crate) fn optimize_in_place(b: &mut Builder) -> OxResult<()> {
    for i in b.order.clone() {
        if b.nodes[i].removed || b.nodes[i].can_be_optimized {
            continue;
        }
        match b.nodes[i].desc.kind.clone() {
            PrimitiveKind::Reorder(p) => {
                if !matches!(p.subtract, ReorderSubtract::None) {
                    continue;
                }
                let dep = b.nodes[i].dependencies[0];
                if b.nodes[dep].is_input() {
                    continue;
                }
                if b.layout(dep) == b.layout(i) {
                    debug!(node = %b.nodes[i].desc.id, "identity reorder optimised out");
                    b.nodes[i].can_be_optimized = true;
                    b.nodes[i].alias_target = Some(dep);
                }
            }
            PrimitiveKind::Reshape(_) => {
                let dep = b.nodes[i].dependencies[0];
                if b.nodes[dep].is_input() {
                    continue;
                }
                let dep_layout = b.layout(dep);
                if dep_layout.simple()
                    && dep_layout.padding.is_zero()
                    && b.layout(i).padding.is_zero()
                {
                    debug!(node = %b.nodes[i].desc.id, "reshape optimised to a view");
                    b.nodes[i].can_be_optimized = true;
                    b.nodes[i].alias_target = Some(dep);
                }
            }
            PrimitiveKind::Crop(p) => {
                let dep = b.nodes[i].dependencies[0];
                let dep_node = &b.nodes[dep];
                if dep_node.is_input()
                    || dep_node.is_constant()
                    || dep_node.can_be_optimized
                    || dep_node.users.len() != 1
                {
                    continue;
                }
                let dep_layout = b.layout(dep).clone();
                if !dep_layout.simple() || !dep_layout.padding.is_zero() {
                    continue;
                }
                if !b.layout(i).padding.is_zero() {
                    continue;
                }
                debug!(node = %b.nodes[i].desc.id, "crop optimised to a sub-window view");
                b.nodes[i].output_layout = Some(alias_window(&dep_layout, p.size, p.offsets));
                b.nodes[i].can_be_optimized = true;
                b.nodes[i].alias_target = Some(dep);
            }
            PrimitiveKind::Concatenation(p) => {
                if p.axis != Axis::Feature {
                    continue;
                }
                let out_layout = b.layout(i).clone();
                if !out_layout.simple() || !out_layout.padding.is_zero() {
                    continue;
                }
                let deps = b.nodes[i].dependencies.clone();
                let fits = deps.iter().all(|&d| {
                    let dn = &b.nodes[d];
                    let dl = b.layout(d);
                    !dn.is_input()
                        && !dn.is_constant()
                        && !dn.can_be_optimized
                        && dn.alias_target.is_none()
                        && dn.users.len() == 1
                        && dl.simple()
                        && dl.format == out_layout.format
                        && dl.data_type == out_layout.data_type
                        && dl.padding.is_zero()
                });
                if !fits {
                    continue;
                }
                debug!(node = %b.nodes[i].desc.id, "concatenation optimised in place");
                b.nodes[i].can_be_optimized = true;
                let total = out_layout.size.feature;
                let mut offset = 0usize;
                for d in deps {
                    let dl = b.layout(d).clone();
                    let features = dl.size.feature;
                    b.nodes[d].output_layout = Some(alias_window(
                        &Layout::new(
                            dl.data_type,
                            dl.format,
                            dl.size.with_axis(Axis::Feature, total),
                        ),
                        dl.size,
                        TensorShape::new(0, offset, 0, 0),
                    ));
                    b.nodes[d].alias_target = Some(i);
                    offset += features;
                }
            }
            _ => {}
        }
    }
    Ok(())
}
