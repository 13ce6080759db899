//! Kernel selection: lowers each node into its layout-neutral parameter
//! form, asks the kind's selector for the best candidate, and resolves
//! weights-reorder requests against constant data at build time.

use tracing::debug;

use crate::engine::Engine;
use crate::errors::{OxError, OxResult};
use crate::kernels::{self, BaseParams, KernelData, KernelRunner, OptionalParams};
use crate::memory::Memory;
use crate::program::{layout, BuildOptions, Builder};
use crate::tensor::{Format, Layout};
use crate::topology::{PrimitiveDesc, PrimitiveKind, ReorderParams, ReorderSubtract};

pub(crate) fn select_kernels(
    b: &mut Builder,
    engine: &Engine,
    options: &BuildOptions,
) -> OxResult<()> {
    let runner = options.tuning.as_deref();
    for i in b.order.clone() {
        if b.nodes[i].removed || b.nodes[i].can_be_optimized {
            continue;
        }
        let opts = OptionalParams {
            meaningful_kernel_names: engine.config().meaningful_kernel_names,
            primitive_id: b.nodes[i].desc.id.clone(),
        };
        let kind = b.nodes[i].desc.kind.clone();
        let output = b.layout(i).clone();
        let deps = b.nodes[i].dependencies.clone();
        let dep_layout = |k: usize| -> Layout { b.layout(deps[k]).clone() };
        let data_inputs = b.nodes[i].data_input_count();

        let selected: Vec<KernelData> = match &kind {
            PrimitiveKind::InputLayout(_) | PrimitiveKind::Data(_) => continue,

            PrimitiveKind::PriorBox(p) => {
                let constant = layout::compute_prior_box(p, &dep_layout(0), &output)?;
                b.nodes[i].constant = Some(constant);
                continue;
            }

            PrimitiveKind::Activation(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone())
                    .with_activation(Some(p.info));
                vec![kernels::activation::selector().select(
                    &kernels::activation::ActivationKernelParams { base },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Eltwise(p) => {
                let base = BaseParams::new(vec![dep_layout(0), dep_layout(1)], output.clone())
                    .with_activation(p.with_activation);
                vec![kernels::eltwise::selector().select(
                    &kernels::eltwise::EltwiseKernelParams { base, mode: p.mode },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Softmax(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone());
                vec![kernels::softmax::selector().select(
                    &kernels::softmax::SoftmaxKernelParams { base, dimension: p.dimension },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Convolution(p) => {
                // a candidate may ask for its activations through another
                // format; inject the reorder it wants and reselect
                let mut attempts = 0;
                let kd = loop {
                    let input0 = b.layout(b.nodes[i].dependencies[0]).clone();
                    let weights = b.layout(b.nodes[i].dependencies[data_inputs]).clone();
                    let params = kernels::convolution::ConvolutionKernelParams {
                        base: BaseParams::new(vec![input0], output.clone())
                            .with_activation(p.with_activation),
                        weights,
                        bias_term: !p.bias.is_empty(),
                        stride: p.stride,
                        dilation: p.dilation,
                        input_offset: p.input_offset,
                        split: p.split.max(1),
                    };
                    let kd = kernels::convolution::selector().select(&params, &opts, runner)?;
                    let request = kd
                        .input_reorders
                        .iter()
                        .find(|r| {
                            b.layout(b.nodes[i].dependencies[r.input]).format != r.target
                        })
                        .copied();
                    let Some(request) = request else { break kd };
                    if attempts >= 4 {
                        return Err(OxError::UnsupportedConfiguration(format!(
                            "primitive '{}': kernel transform requests did not converge",
                            b.nodes[i].desc.id
                        )));
                    }
                    attempts += 1;
                    inject_input_reorder(b, i, request.input, request.target, engine, runner)?;
                };
                reorder_weights(b, i, data_inputs, p.weights.len(), &kd)?;
                vec![kd]
            }

            PrimitiveKind::Deconvolution(p) => {
                let weights = dep_layout(data_inputs);
                let base = BaseParams::new(vec![dep_layout(0)], output.clone())
                    .with_activation(p.with_activation);
                let params = kernels::deconvolution::DeconvolutionKernelParams {
                    base,
                    weights,
                    bias_term: !p.bias.is_empty(),
                    stride: p.stride,
                    input_offset: p.input_offset,
                    split: p.split.max(1),
                };
                let kd = kernels::deconvolution::selector().select(&params, &opts, runner)?;
                reorder_weights(b, i, data_inputs, p.weights.len(), &kd)?;
                vec![kd]
            }

            PrimitiveKind::FullyConnected(p) => {
                let weights = dep_layout(data_inputs);
                let base = BaseParams::new(vec![dep_layout(0)], output.clone())
                    .with_activation(p.with_activation);
                let params = kernels::fully_connected::FullyConnectedKernelParams {
                    base,
                    weights,
                    bias_term: p.bias.is_some(),
                };
                let kd = kernels::fully_connected::selector().select(&params, &opts, runner)?;
                reorder_weights(b, i, data_inputs, 1, &kd)?;
                vec![kd]
            }

            PrimitiveKind::Pooling(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone());
                vec![kernels::pooling::selector().select(
                    &kernels::pooling::PoolingKernelParams {
                        base,
                        mode: p.mode,
                        size: p.size,
                        stride: p.stride,
                        input_offset: p.input_offset,
                    },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Concatenation(p) => {
                let mut kds = Vec::with_capacity(deps.len());
                let mut offset = 0usize;
                for (j, &d) in deps.iter().enumerate() {
                    let input = b.layout(d).clone();
                    let extent = input.size.get(p.axis);
                    let base = BaseParams::new(vec![input], output.clone());
                    kds.push(kernels::concatenation::selector().select(
                        &kernels::concatenation::ConcatKernelParams {
                            base,
                            axis: p.axis,
                            axis_offset: offset,
                            input_index: j,
                        },
                        &opts,
                        runner,
                    )?);
                    offset += extent;
                }
                kds
            }

            PrimitiveKind::Crop(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone());
                vec![kernels::crop::selector().select(
                    &kernels::crop::CropKernelParams { base, offsets: p.offsets },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Reorder(p) => {
                let base = BaseParams::new(
                    deps.iter().map(|&d| b.layout(d).clone()).collect(),
                    output.clone(),
                );
                let subtract = match &p.subtract {
                    ReorderSubtract::None => kernels::reorder::ReorderSubtractLowered::None,
                    ReorderSubtract::PerFeature(v) => {
                        kernels::reorder::ReorderSubtractLowered::PerFeature(v.clone())
                    }
                    ReorderSubtract::Mean(_) => {
                        kernels::reorder::ReorderSubtractLowered::Mean(dep_layout(1))
                    }
                };
                vec![kernels::reorder::selector().select(
                    &kernels::reorder::ReorderKernelParams { base, subtract },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Reshape(_) => {
                // a reshape that could not become a view degenerates to a
                // flat copy through the reorder kernel
                let input = dep_layout(0);
                let flat = Layout::new(input.data_type, input.format, input.size);
                let base = BaseParams::new(vec![input], flat);
                vec![kernels::reorder::selector().select(
                    &kernels::reorder::ReorderKernelParams {
                        base,
                        subtract: kernels::reorder::ReorderSubtractLowered::None,
                    },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Scale(_) => {
                let base = BaseParams::new(
                    deps.iter().map(|&d| b.layout(d).clone()).collect(),
                    output.clone(),
                );
                vec![kernels::scale::selector().select(
                    &kernels::scale::ScaleKernelParams { bias_term: deps.len() == 3, base },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::MeanSubtract(_) => {
                let base =
                    BaseParams::new(vec![dep_layout(0), dep_layout(1)], output.clone());
                vec![kernels::mean_subtract::selector().select(
                    &kernels::mean_subtract::MeanSubtractKernelParams { base },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::BatchNorm(p) => {
                let base = BaseParams::new(
                    vec![dep_layout(0), dep_layout(1), dep_layout(2)],
                    output.clone(),
                );
                vec![kernels::batch_norm::selector().select(
                    &kernels::batch_norm::BatchNormKernelParams { base, epsilon: p.epsilon },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Lrn(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone());
                vec![kernels::lrn::selector().select(
                    &kernels::lrn::LrnKernelParams {
                        base,
                        size: p.size,
                        k: p.k,
                        alpha: p.alpha,
                        beta: p.beta,
                        norm_region: p.norm_region,
                    },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Normalize(p) => {
                let base =
                    BaseParams::new(vec![dep_layout(0), dep_layout(1)], output.clone());
                vec![kernels::normalize::selector().select(
                    &kernels::normalize::NormalizeKernelParams {
                        base,
                        across_spatial: p.across_spatial,
                        epsilon: p.epsilon,
                    },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Permute(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone());
                vec![kernels::permute::selector().select(
                    &kernels::permute::PermuteKernelParams { base, order: p.order },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Upsampling(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone());
                vec![kernels::upsampling::selector().select(
                    &kernels::upsampling::UpsamplingKernelParams {
                        base,
                        scale: p.scale,
                        mode: p.mode,
                    },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::ArgMaxMin(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone());
                vec![kernels::arg_max_min::selector().select(
                    &kernels::arg_max_min::ArgMaxMinKernelParams {
                        base,
                        out: p.out,
                        axis: p.axis,
                        top_k: p.top_k,
                    },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::LookupTable(p) => {
                let base =
                    BaseParams::new(vec![dep_layout(0), dep_layout(1)], output.clone());
                vec![kernels::lookup_table::selector().select(
                    &kernels::lookup_table::LookupTableKernelParams { base, axis: p.axis },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::IndexSelect(p) => {
                let base =
                    BaseParams::new(vec![dep_layout(0), dep_layout(1)], output.clone());
                vec![kernels::index_select::selector().select(
                    &kernels::index_select::IndexSelectKernelParams { base, axis: p.axis },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::RegionYolo(p) => {
                let base = BaseParams::new(vec![dep_layout(0)], output.clone());
                vec![kernels::region_yolo::selector().select(
                    &kernels::region_yolo::RegionYoloKernelParams {
                        base,
                        coords: p.coords,
                        classes: p.classes,
                        num: p.num,
                        do_softmax: p.do_softmax,
                    },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::RoiPooling(p) => {
                let base =
                    BaseParams::new(vec![dep_layout(0), dep_layout(1)], output.clone());
                vec![kernels::roi_pooling::selector().select(
                    &kernels::roi_pooling::RoiPoolingKernelParams {
                        base,
                        pooled_size: p.pooled_size,
                        spatial_scale: p.spatial_scale,
                    },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::SimplerNms(p) => {
                let base = BaseParams::new(
                    vec![dep_layout(0), dep_layout(1), dep_layout(2)],
                    output.clone(),
                );
                vec![kernels::simpler_nms::selector().select(
                    &kernels::simpler_nms::SimplerNmsKernelParams { base, nms: p.clone() },
                    &opts,
                    runner,
                )?]
            }

            PrimitiveKind::Custom(p) => {
                let base = BaseParams::new(
                    deps.iter().map(|&d| b.layout(d).clone()).collect(),
                    output.clone(),
                );
                vec![kernels::custom::selector().select(
                    &kernels::custom::CustomKernelParams { base, desc: p.clone() },
                    &opts,
                    runner,
                )?]
            }
        };

        debug!(
            node = %b.nodes[i].desc.id,
            kernels = selected.len(),
            template = selected.first().map(|k| k.template).unwrap_or(""),
            "kernel selected"
        );
        b.nodes[i].selected = selected;
    }

    if let Some(dir) = options.dump_custom_program.clone() {
        dump_program(b, engine, &dir)?;
    }
    Ok(())
}

/// Honours a kernel's input-transform request: a reorder node is spliced
/// in front of the consumer's input, its copy kernel selected on the
/// spot, and the caller reruns selection against the new layout.
fn inject_input_reorder(
    b: &mut Builder,
    consumer: usize,
    pos: usize,
    target: Format,
    engine: &Engine,
    runner: Option<&dyn KernelRunner>,
) -> OxResult<usize> {
    let dep = b.nodes[consumer].dependencies[pos];
    let dep_layout = b.layout(dep).clone();
    let target_layout = dep_layout.transform(target);
    let id = format!("{}_input{}_{}_reorder", b.nodes[consumer].desc.id, pos, target.tag());
    debug!(
        consumer = %b.nodes[consumer].desc.id,
        from = dep_layout.format.tag(),
        to = target.tag(),
        "kernel-requested input transform"
    );
    let desc = PrimitiveDesc::new(
        id.clone(),
        PrimitiveKind::Reorder(ReorderParams {
            output_layout: target_layout.clone(),
            subtract: ReorderSubtract::None,
        }),
        vec![b.nodes[dep].desc.id.clone()],
    );
    let inserted = b.insert_node(desc, target_layout.clone(), dep);
    b.nodes[consumer].dependencies[pos] = inserted;
    b.rebuild_users();

    let opts = OptionalParams {
        meaningful_kernel_names: engine.config().meaningful_kernel_names,
        primitive_id: id,
    };
    let kd = kernels::reorder::selector().select(
        &kernels::reorder::ReorderKernelParams {
            base: BaseParams::new(vec![dep_layout], target_layout),
            subtract: kernels::reorder::ReorderSubtractLowered::None,
        },
        &opts,
        runner,
    )?;
    b.nodes[inserted].selected = vec![kd];
    Ok(inserted)
}

/// Resolves a kernel's weights-reorder request against the constant data
/// nodes feeding the consumer; the transformed tensors ride on the
/// consuming node so a weights constant shared by several consumers stays
/// untouched.
fn reorder_weights(
    b: &mut Builder,
    node: usize,
    data_inputs: usize,
    split_count: usize,
    kd: &KernelData,
) -> OxResult<()> {
    let Some(request) = &kd.weights_reorder else { return Ok(()) };
    let mut transformed: Vec<Memory> = Vec::with_capacity(split_count);
    for s in 0..split_count {
        let weights_dep = b.nodes[node].dependencies[data_inputs + s];
        let Some(constant) = b.nodes[weights_dep].constant.clone() else {
            return Err(OxError::NotImplemented(format!(
                "primitive '{}': weights reorder requires constant data weights",
                b.nodes[node].desc.id
            )));
        };
        let target = Layout::new(
            request.target.data_type,
            request.target.format,
            constant.layout().size,
        );
        transformed.push(constant.reordered(target)?);
    }
    debug!(
        node = %b.nodes[node].desc.id,
        target = request.target.format.tag(),
        splits = split_count,
        "weights transformed at build time"
    );
    b.nodes[node].reordered_weights = transformed;
    Ok(())
}

/// Writes every selected kernel's assembled source plus a manifest to the
/// requested directory.
fn dump_program(b: &Builder, engine: &Engine, dir: &std::path::Path) -> OxResult<()> {
    std::fs::create_dir_all(dir)?;
    let mut manifest = Vec::new();
    for node in b.nodes.iter().filter(|n| !n.removed) {
        for (k, kd) in node.selected.iter().enumerate() {
            let source = engine.assemble_source(kd)?;
            let file = format!("{}_{k}.cl", kd.entry_point);
            std::fs::write(dir.join(&file), &source.code)?;
            manifest.push(serde_json::json!({
                "primitive": node.desc.id,
                "template": kd.template,
                "entry_point": kd.entry_point,
                "file": file,
            }));
        }
    }
    let manifest = serde_json::to_string_pretty(&manifest)
        .map_err(|e| OxError::InvalidArgument(e.to_string()))?;
    std::fs::write(dir.join("manifest.json"), manifest)?;
    Ok(())
}
