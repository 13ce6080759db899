use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, filter_jit};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
    WeightsReorder,
};
use crate::tensor::{Format, Layout};

#[derive(Debug, Clone)]
pub struct DeconvolutionKernelParams {
    pub base: BaseParams,
    pub weights: Layout,
    pub bias_term: bool,
    pub stride: (usize, usize),
    pub input_offset: (i32, i32),
    pub split: usize,
}

struct DeconvolutionRef;

impl KernelBase<DeconvolutionKernelParams> for DeconvolutionRef {
    fn kernel_name(&self) -> &'static str {
        "deconvolution_ref"
    }

    fn supports(&self, p: &DeconvolutionKernelParams) -> bool {
        p.base.input(0).simple() && p.base.output.simple() && p.stride.0 >= 1 && p.stride.1 >= 1
    }

    fn build(
        &self,
        p: &DeconvolutionKernelParams,
        options: &OptionalParams,
    ) -> OxResult<KernelData> {
        let mut kd =
            KernelData::new("deconvolution_ref", options.entry_point("deconvolution_ref"));
        let weights = p.weights.transform(Format::Oiyx);
        kd.jit = base_jit(&p.base);
        kd.jit.merge(filter_jit("FILTER", &weights));
        kd.jit.add_int("STRIDE_Y", p.stride.0 as i64);
        kd.jit.add_int("STRIDE_X", p.stride.1 as i64);
        kd.jit.add_int("INPUT_OFFSET_Y", p.input_offset.0 as i64);
        kd.jit.add_int("INPUT_OFFSET_X", p.input_offset.1 as i64);
        kd.jit.add_int("BIAS_TERM", p.bias_term as i64);
        kd.jit.add_int("SPLIT_NUM", p.split as i64);
        let out = p.base.output.size;
        kd.gws = [out.x.max(1), out.y.max(1), (out.batch * p.weights.size.batch).max(1)];
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output, ArgumentKind::Weights];
        if p.bias_term {
            kd.arguments.push(ArgumentKind::Bias);
        }
        kd.arguments.push(ArgumentKind::SplitIndex);
        if p.weights.format != Format::Oiyx {
            kd.weights_reorder = Some(WeightsReorder { target: weights });
        }
        let w = p.weights.size;
        kd.estimated_time = (p.base.output.logical_size() * w.feature * w.y * w.x) as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<DeconvolutionKernelParams> {
    KernelSelector::new("deconvolution", vec![Box::new(DeconvolutionRef)])
}
