use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, filter_jit};
use crate::kernels::{
    ArgumentKind, BaseParams, InputReorder, KernelBase, KernelData, KernelPriority,
    KernelSelector, OptionalParams, WeightsReorder,
};
use crate::tensor::{Format, Layout};
use crate::types::DataType;

#[derive(Debug, Clone)]
pub struct ConvolutionKernelParams {
    pub base: BaseParams,
    /// Current layout of one split's weights constant.
    pub weights: Layout,
    pub bias_term: bool,
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub input_offset: (i32, i32),
    pub split: usize,
}

fn common_jit(p: &ConvolutionKernelParams, weights: &Layout) -> crate::kernels::JitConstants {
    let mut jit = base_jit(&p.base);
    jit.merge(filter_jit("FILTER", weights));
    jit.add_int("STRIDE_Y", p.stride.0 as i64);
    jit.add_int("STRIDE_X", p.stride.1 as i64);
    jit.add_int("DILATION_Y", p.dilation.0 as i64);
    jit.add_int("DILATION_X", p.dilation.1 as i64);
    jit.add_int("INPUT_OFFSET_Y", p.input_offset.0 as i64);
    jit.add_int("INPUT_OFFSET_X", p.input_offset.1 as i64);
    jit.add_int("BIAS_TERM", p.bias_term as i64);
    jit.add_int("SPLIT_NUM", p.split as i64);
    jit
}

fn common_arguments(p: &ConvolutionKernelParams) -> Vec<ArgumentKind> {
    let mut args = vec![ArgumentKind::Input(0), ArgumentKind::Output, ArgumentKind::Weights];
    if p.bias_term {
        args.push(ArgumentKind::Bias);
    }
    args.push(ArgumentKind::SplitIndex);
    args
}

/// One work item per output element of one split.
fn conv_gws(p: &ConvolutionKernelParams) -> [usize; 3] {
    let out = p.base.output.size;
    let ofm_per_split = p.weights.size.batch;
    [out.x.max(1), out.y.max(1), (out.batch * ofm_per_split).max(1)]
}

fn macs(p: &ConvolutionKernelParams) -> f32 {
    let w = p.weights.size;
    (p.base.output.logical_size() * w.feature * w.y * w.x) as f32
}

struct ConvolutionRef;

impl KernelBase<ConvolutionKernelParams> for ConvolutionRef {
    fn kernel_name(&self) -> &'static str {
        "convolution_ref"
    }

    fn supports(&self, p: &ConvolutionKernelParams) -> bool {
        p.base.input(0).simple()
            && p.base.output.simple()
            && p.stride.0 >= 1
            && p.stride.1 >= 1
            && p.dilation.0 >= 1
            && p.dilation.1 >= 1
    }

    fn build(&self, p: &ConvolutionKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("convolution_ref", options.entry_point("convolution_ref"));
        let weights = p.weights.transform(Format::Oiyx);
        kd.jit = common_jit(p, &weights);
        kd.gws = conv_gws(p);
        kd.arguments = common_arguments(p);
        if p.weights.format != Format::Oiyx {
            kd.weights_reorder = Some(WeightsReorder { target: weights });
        }
        kd.estimated_time = macs(p);
        Ok(kd)
    }
}

/// Blocked-weights variant: requires bfyx f32 activations and transforms
/// the filter into os_iyx_osv16 so a sub-group reads 16 output features at
/// once. Preferred over the reference kernel whenever it applies.
struct ConvolutionBfyxOsIyxOsv16;

impl KernelBase<ConvolutionKernelParams> for ConvolutionBfyxOsIyxOsv16 {
    fn kernel_name(&self) -> &'static str {
        "convolution_bfyx_os_iyx_osv16"
    }

    fn supports(&self, p: &ConvolutionKernelParams) -> bool {
        p.base.input(0).format == Format::Bfyx
            && p.base.output.format == Format::Bfyx
            && p.base.input(0).data_type == DataType::F32
            && p.dilation == (1, 1)
            && p.weights.size.batch >= 16
    }

    fn estimate(&self, _p: &ConvolutionKernelParams) -> KernelPriority {
        KernelPriority::Force(4)
    }

    fn build(&self, p: &ConvolutionKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new(
            "convolution_bfyx_os_iyx_osv16",
            options.entry_point("convolution_bfyx_os_iyx_osv16"),
        );
        let weights = p.weights.transform(Format::OsIyxOsv16);
        kd.jit = common_jit(p, &weights);
        kd.gws = conv_gws(p);
        kd.lws = Some([1, 1, 16]);
        kd.arguments = common_arguments(p);
        if p.weights.format != Format::OsIyxOsv16 {
            kd.weights_reorder = Some(WeightsReorder { target: weights });
        }
        kd.estimated_time = macs(p) / 4.0;
        Ok(kd)
    }
}

/// Batch-parallel variant: wants its activations in yxfb so one output
/// position's loads coalesce across the batch. When the producer emits a
/// different simple format, the candidate asks the pipeline to reorder it;
/// selection reruns once the transform is in place.
struct ConvolutionYxfbOiyxB8;

impl KernelBase<ConvolutionKernelParams> for ConvolutionYxfbOiyxB8 {
    fn kernel_name(&self) -> &'static str {
        "convolution_yxfb_oiyx_b8"
    }

    fn supports(&self, p: &ConvolutionKernelParams) -> bool {
        let batch = p.base.input(0).size.batch;
        p.base.input(0).simple()
            && p.base.output.simple()
            && p.base.input(0).data_type == DataType::F32
            && p.dilation == (1, 1)
            && batch > 0
            && batch % 8 == 0
    }

    fn estimate(&self, _p: &ConvolutionKernelParams) -> KernelPriority {
        KernelPriority::Force(3)
    }

    fn build(&self, p: &ConvolutionKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new(
            "convolution_yxfb_oiyx_b8",
            options.entry_point("convolution_yxfb_oiyx_b8"),
        );
        let weights = p.weights.transform(Format::Oiyx);
        // jit against the layout the kernel will actually read
        let mut lowered = p.clone();
        if lowered.base.inputs[0].format != Format::Yxfb {
            lowered.base.inputs[0] = lowered.base.inputs[0].transform(Format::Yxfb);
            kd.input_reorders.push(InputReorder { input: 0, target: Format::Yxfb });
        }
        kd.jit = common_jit(&lowered, &weights);
        kd.gws = conv_gws(p);
        kd.arguments = common_arguments(p);
        if p.weights.format != Format::Oiyx {
            kd.weights_reorder = Some(WeightsReorder { target: weights });
        }
        kd.estimated_time = macs(p) / 6.0;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<ConvolutionKernelParams> {
    KernelSelector::new(
        "convolution",
        vec![
            Box::new(ConvolutionRef),
            Box::new(ConvolutionBfyxOsIyxOsv16),
            Box::new(ConvolutionYxfbOiyxB8),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorShape;

    fn params(input_format: Format, ofm: usize) -> ConvolutionKernelParams {
        let input =
            Layout::new(DataType::F32, input_format, TensorShape::new(1, 8, 8, 8));
        let output =
            Layout::new(DataType::F32, input_format, TensorShape::new(1, ofm, 6, 6));
        ConvolutionKernelParams {
            base: BaseParams::new(vec![input], output),
            weights: Layout::new(DataType::F32, Format::Oiyx, TensorShape::new(ofm, 8, 3, 3)),
            bias_term: true,
            stride: (1, 1),
            dilation: (1, 1),
            input_offset: (0, 0),
            split: 1,
        }
    }

    #[test]
    fn blocked_variant_wins_on_bfyx_with_wide_ofm() {
        let chosen = selector()
            .select(&params(Format::Bfyx, 32), &OptionalParams::default(), None)
            .unwrap();
        assert_eq!(chosen.template, "convolution_bfyx_os_iyx_osv16");
        let reorder = chosen.weights_reorder.expect("blocked weights demanded");
        assert_eq!(reorder.target.format, Format::OsIyxOsv16);
    }

    #[test]
    fn reference_handles_small_yxfb_batches() {
        let chosen = selector()
            .select(&params(Format::Yxfb, 32), &OptionalParams::default(), None)
            .unwrap();
        assert_eq!(chosen.template, "convolution_ref");
    }

    #[test]
    fn yxfb_batches_prefer_the_batch_parallel_kernel() {
        let mut p = params(Format::Yxfb, 32);
        p.base.inputs[0].size.batch = 8;
        p.base.output.size.batch = 8;
        let chosen = selector().select(&p, &OptionalParams::default(), None).unwrap();
        assert_eq!(chosen.template, "convolution_yxfb_oiyx_b8");
        assert!(chosen.input_reorders.is_empty());
    }

    #[test]
    fn bfyx_batches_request_a_yxfb_transform() {
        let mut p = params(Format::Bfyx, 32);
        p.base.inputs[0].size.batch = 8;
        p.base.output.size.batch = 8;
        let chosen = selector().select(&p, &OptionalParams::default(), None).unwrap();
        assert_eq!(chosen.template, "convolution_yxfb_oiyx_b8");
        assert_eq!(
            chosen.input_reorders,
            vec![InputReorder { input: 0, target: Format::Yxfb }]
        );
        assert!(chosen.jit.is_defined("INPUT0_LAYOUT_YXFB"));
    }
}
