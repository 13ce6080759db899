use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element, tensor_jit};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};

/// Inputs: value tensor and a mean tensor broadcast over the batch axis
/// (and any other axis it leaves at size one).
#[derive(Debug, Clone)]
pub struct MeanSubtractKernelParams {
    pub base: BaseParams,
}

struct MeanSubtractRef;

impl KernelBase<MeanSubtractKernelParams> for MeanSubtractRef {
    fn kernel_name(&self) -> &'static str {
        "mean_subtract_ref"
    }

    fn supports(&self, p: &MeanSubtractKernelParams) -> bool {
        p.base.inputs.len() == 2 && p.base.input(0).simple() && p.base.input(1).simple()
    }

    fn build(&self, p: &MeanSubtractKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("mean_subtract_ref", options.entry_point("mean_subtract_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.merge(tensor_jit("MEAN", p.base.input(1)));
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments =
            vec![ArgumentKind::Input(0), ArgumentKind::Input(1), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<MeanSubtractKernelParams> {
    KernelSelector::new("mean_subtract", vec![Box::new(MeanSubtractRef)])
}
