//! Initial layout propagation: each kind's output layout is a pure
//! function of its dependencies' layouts and its parameters. Shape
//! invariant violations surface here, naming the offending primitive.

use crate::errors::{OxError, OxResult};
use crate::memory::Memory;
use crate::program::Builder;
use crate::tensor::{Format, Layout, TensorShape};
use crate::topology::{PriorBoxParams, PrimitiveKind};
use crate::types::DataType;

pub(crate) fn propagate(b: &mut Builder) -> OxResult<()> {
    for i in b.order.clone() {
        let mut layout = calc_output_layout(b, i)?;
        let declared = b.nodes[i].desc.output_padding;
        if !declared.is_zero() {
            layout.padding = layout.padding.max(&declared);
        }
        b.nodes[i].output_layout = Some(layout);
    }
    Ok(())
}

fn invalid(id: &str, msg: impl std::fmt::Display) -> OxError {
    OxError::InvalidArgument(format!("primitive '{id}': {msg}"))
}

/// Forward spatial extent: `(in + 2*pad - effective_kernel) / stride + 1`
/// where a negative input offset acts as padding.
fn windowed(id: &str, input: usize, kernel: usize, dilation: usize, stride: usize, offset: i32)
    -> OxResult<usize> {
    let effective = (kernel as i64 - 1) * dilation as i64 + 1;
    let span = input as i64 + 2 * (-offset as i64) - effective;
    if span < 0 {
        return Err(invalid(id, format!("window of {effective} does not fit input of {input}")));
    }
    Ok((span / stride as i64) as usize + 1)
}

fn calc_output_layout(b: &Builder, i: usize) -> OxResult<Layout> {
    let node = &b.nodes[i];
    let id = node.desc.id.clone();
    let dep = |k: usize| -> &Layout { b.layout(node.dependencies[k]) };

    Ok(match &node.desc.kind {
        PrimitiveKind::InputLayout(p) => {
            // external inputs arrive through the plain host-visible formats
            p.layout.expect_simple(&id)?;
            p.layout.clone()
        }
        PrimitiveKind::Data(p) => p.memory.layout().clone(),

        PrimitiveKind::Activation(_)
        | PrimitiveKind::BatchNorm(_)
        | PrimitiveKind::Lrn(_)
        | PrimitiveKind::MeanSubtract(_)
        | PrimitiveKind::Normalize(_)
        | PrimitiveKind::Scale(_)
        | PrimitiveKind::Softmax(_) => {
            let input = dep(0);
            Layout::new(input.data_type, input.format, input.size)
        }

        PrimitiveKind::Eltwise(_) => {
            let a = dep(0);
            let c = dep(1);
            if a.size != c.size {
                return Err(invalid(
                    &id,
                    format!("eltwise inputs disagree on shape: {} vs {}", a.size, c.size),
                ));
            }
            if a.data_type != c.data_type {
                return Err(invalid(&id, "eltwise inputs disagree on element type"));
            }
            Layout::new(a.data_type, a.format, a.size)
        }

        PrimitiveKind::Concatenation(p) => {
            let first = dep(0).clone();
            let mut total = 0usize;
            for k in 0..node.dependencies.len() {
                let l = dep(k);
                if l.data_type != first.data_type {
                    return Err(invalid(&id, "concatenation inputs disagree on element type"));
                }
                let mut rest_a = l.size;
                let mut rest_b = first.size;
                rest_a.set(p.axis, 0);
                rest_b.set(p.axis, 0);
                if rest_a != rest_b {
                    return Err(invalid(
                        &id,
                        format!(
                            "concatenation input {k} shape {} incompatible with {}",
                            l.size, first.size
                        ),
                    ));
                }
                total += l.size.get(p.axis);
            }
            Layout::new(first.data_type, first.format, first.size.with_axis(p.axis, total))
        }

        PrimitiveKind::Convolution(p) => {
            let input = dep(0);
            let weights = dep(node.data_input_count());
            let out_y = windowed(&id, input.size.y, weights.size.y, p.dilation.0, p.stride.0,
                p.input_offset.0)?;
            let out_x = windowed(&id, input.size.x, weights.size.x, p.dilation.1, p.stride.1,
                p.input_offset.1)?;
            let out_f = weights.size.batch * p.split.max(1);
            Layout::new(
                input.data_type,
                input.format,
                TensorShape::new(input.size.batch, out_f, out_y, out_x),
            )
        }

        PrimitiveKind::Deconvolution(p) => {
            let input = dep(0);
            let weights = dep(node.data_input_count());
            let out_y = (input.size.y as i64 - 1) * p.stride.0 as i64
                + weights.size.y as i64
                + 2 * p.input_offset.0 as i64;
            let out_x = (input.size.x as i64 - 1) * p.stride.1 as i64
                + weights.size.x as i64
                + 2 * p.input_offset.1 as i64;
            if out_y <= 0 || out_x <= 0 {
                return Err(invalid(&id, "deconvolution output collapses to zero"));
            }
            let out_f = weights.size.batch * p.split.max(1);
            Layout::new(
                input.data_type,
                input.format,
                TensorShape::new(input.size.batch, out_f, out_y as usize, out_x as usize),
            )
        }

        PrimitiveKind::Pooling(p) => {
            let input = dep(0);
            let out_y = windowed(&id, input.size.y, p.size.0, 1, p.stride.0, p.input_offset.0)?;
            let out_x = windowed(&id, input.size.x, p.size.1, 1, p.stride.1, p.input_offset.1)?;
            Layout::new(
                input.data_type,
                input.format,
                TensorShape::new(input.size.batch, input.size.feature, out_y, out_x),
            )
        }

        PrimitiveKind::FullyConnected(_) => {
            let input = dep(0);
            let weights = dep(node.data_input_count());
            Layout::new(
                input.data_type,
                input.format,
                TensorShape::new(input.size.batch, weights.size.batch, 1, 1),
            )
        }

        PrimitiveKind::Crop(p) => {
            let input = dep(0);
            let end = p.size.add(&p.offsets);
            if end.batch > input.size.batch
                || end.feature > input.size.feature
                || end.y > input.size.y
                || end.x > input.size.x
            {
                return Err(invalid(
                    &id,
                    format!("crop window {} at {} exceeds input {}", p.size, p.offsets, input.size),
                ));
            }
            Layout::new(input.data_type, input.format, p.size)
        }

        PrimitiveKind::Reshape(p) => {
            let input = dep(0);
            if input.size.count() != p.output_shape.count() {
                return Err(invalid(
                    &id,
                    format!("reshape changes element count {} -> {}", input.size, p.output_shape),
                ));
            }
            Layout::new(input.data_type, input.format, p.output_shape)
        }

        PrimitiveKind::Reorder(p) => {
            let input = dep(0);
            Layout {
                data_type: p.output_layout.data_type,
                format: p.output_layout.format,
                size: input.size,
                padding: p.output_layout.padding,
            }
        }

        PrimitiveKind::Permute(p) => {
            let input = dep(0);
            let s = [input.size.batch, input.size.feature, input.size.y, input.size.x];
            Layout::new(
                input.data_type,
                input.format,
                TensorShape::new(s[p.order[0]], s[p.order[1]], s[p.order[2]], s[p.order[3]]),
            )
        }

        PrimitiveKind::Upsampling(p) => {
            let input = dep(0);
            Layout::new(
                input.data_type,
                input.format,
                TensorShape::new(
                    input.size.batch,
                    input.size.feature,
                    input.size.y * p.scale,
                    input.size.x * p.scale,
                ),
            )
        }

        PrimitiveKind::ArgMaxMin(p) => {
            let input = dep(0);
            let size = match p.axis {
                Some(axis) => {
                    if input.size.get(axis) < p.top_k {
                        return Err(invalid(&id, "top_k exceeds the reduced axis extent"));
                    }
                    input.size.with_axis(axis, p.top_k)
                }
                None => TensorShape::new(input.size.batch, 1, 1, p.top_k),
            };
            Layout::new(input.data_type, input.format, size)
        }

        PrimitiveKind::LookupTable(_) => {
            let input = dep(0);
            let indices = dep(1);
            Layout::new(input.data_type, indices.format, indices.size)
        }

        PrimitiveKind::IndexSelect(p) => {
            let input = dep(0);
            let indices = dep(1);
            Layout::new(
                input.data_type,
                input.format,
                input.size.with_axis(p.axis, indices.logical_size()),
            )
        }

        PrimitiveKind::RegionYolo(_) => {
            let input = dep(0);
            Layout::new(input.data_type, input.format, input.size)
        }

        PrimitiveKind::RoiPooling(p) => {
            let input = dep(0);
            let rois = dep(1);
            Layout::new(
                input.data_type,
                input.format,
                TensorShape::new(
                    rois.size.batch,
                    input.size.feature,
                    p.pooled_size.0,
                    p.pooled_size.1,
                ),
            )
        }

        PrimitiveKind::SimplerNms(p) => {
            let input = dep(0);
            Layout::new(
                input.data_type,
                Format::Bfyx,
                TensorShape::new(p.post_nms_topn, 1, 1, 5),
            )
        }

        PrimitiveKind::PriorBox(p) => {
            let input = dep(0);
            let priors = prior_count(p);
            let total = input.size.x * input.size.y * priors * 4;
            Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 2, total, 1))
        }

        PrimitiveKind::Custom(p) => p.output_layout.clone(),
    })
}

/// Deduplicated aspect-ratio list: always starts at 1, optionally mirrored.
pub(crate) fn prior_aspects(p: &PriorBoxParams) -> Vec<f32> {
    let mut aspects = vec![1.0f32];
    for &ar in &p.aspect_ratios {
        if aspects.iter().any(|a| (a - ar).abs() < 1e-6) {
            continue;
        }
        aspects.push(ar);
        if p.flip {
            aspects.push(1.0 / ar);
        }
    }
    aspects
}

pub(crate) fn prior_count(p: &PriorBoxParams) -> usize {
    prior_aspects(p).len() * p.min_sizes.len() + p.max_sizes.len()
}

/// Computes the prior-box constant at build time; the node carries the
/// result and runs no kernel.
pub(crate) fn compute_prior_box(
    p: &PriorBoxParams,
    input: &Layout,
    output: &Layout,
) -> OxResult<Memory> {
    let grid_w = input.size.x;
    let grid_h = input.size.y;
    let (img_h, img_w) = (p.image_size.0 as f32, p.image_size.1 as f32);
    let step_w = if p.step_width > 0.0 { p.step_width } else { img_w / grid_w as f32 };
    let step_h = if p.step_height > 0.0 { p.step_height } else { img_h / grid_h as f32 };
    let aspects = prior_aspects(p);

    let mut boxes: Vec<f32> = Vec::with_capacity(output.size.y);
    let mut push_box = |cx: f32, cy: f32, w: f32, h: f32| {
        let mut vals = [
            (cx - w / 2.0) / img_w,
            (cy - h / 2.0) / img_h,
            (cx + w / 2.0) / img_w,
            (cy + h / 2.0) / img_h,
        ];
        if p.clip {
            for v in &mut vals {
                *v = v.clamp(0.0, 1.0);
            }
        }
        boxes.extend_from_slice(&vals);
    };

    for y in 0..grid_h {
        for x in 0..grid_w {
            let cx = (x as f32 + p.offset) * step_w;
            let cy = (y as f32 + p.offset) * step_h;
            for (m, &min) in p.min_sizes.iter().enumerate() {
                push_box(cx, cy, min, min);
                if let Some(&max) = p.max_sizes.get(m) {
                    let size = (min * max).sqrt();
                    push_box(cx, cy, size, size);
                }
                for &ar in &aspects {
                    if (ar - 1.0).abs() < 1e-6 {
                        continue;
                    }
                    let sq = ar.sqrt();
                    push_box(cx, cy, min * sq, min / sq);
                }
            }
        }
    }

    let variances = if p.variance.is_empty() { vec![0.1f32] } else { p.variance.clone() };
    let total = boxes.len();
    let mut values = vec![0.0f32; output.physical_size()];
    for (i, v) in boxes.iter().enumerate() {
        values[output.element_offset(0, 0, i, 0)] = *v;
    }
    // a single variance value broadcasts; four values repeat per prior
    for i in 0..total {
        values[output.element_offset(0, 1, i, 0)] =
            if variances.len() == 4 { variances[i % 4] } else { variances[0] };
    }

    let memory = Memory::allocate(output.clone())?;
    memory.write_all(&values)?;
    Ok(memory)
}
