use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};

/// Inputs: value tensor, per-feature mean, per-feature variance.
#[derive(Debug, Clone)]
pub struct BatchNormKernelParams {
    pub base: BaseParams,
    pub epsilon: f32,
}

struct BatchNormRef;

impl KernelBase<BatchNormKernelParams> for BatchNormRef {
    fn kernel_name(&self) -> &'static str {
        "batch_norm_ref"
    }

    fn supports(&self, p: &BatchNormKernelParams) -> bool {
        p.base.inputs.len() == 3
            && p.base.input(0).simple()
            && p.base.input(1).size.feature == p.base.input(0).size.feature
            && p.base.input(2).size.feature == p.base.input(0).size.feature
    }

    fn build(&self, p: &BatchNormKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("batch_norm_ref", options.entry_point("batch_norm_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.add_float("EPSILON", p.epsilon);
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments = vec![
            ArgumentKind::Input(0),
            ArgumentKind::Input(1),
            ArgumentKind::Input(2),
            ArgumentKind::Output,
        ];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<BatchNormKernelParams> {
    KernelSelector::new("batch_norm", vec![Box::new(BatchNormRef)])
}
