use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};

#[derive(Debug, Clone)]
pub struct ActivationKernelParams {
    pub base: BaseParams,
}

struct ActivationRef;

impl KernelBase<ActivationKernelParams> for ActivationRef {
    fn kernel_name(&self) -> &'static str {
        "activation_ref"
    }

    fn supports(&self, p: &ActivationKernelParams) -> bool {
        p.base.activation.is_some()
            && p.base.input(0).simple()
            && p.base.output.simple()
            && p.base.input(0).size == p.base.output.size
    }

    fn build(&self, p: &ActivationKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("activation_ref", options.entry_point("activation_ref"));
        kd.jit = base_jit(&p.base);
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<ActivationKernelParams> {
    KernelSelector::new("activation", vec![Box::new(ActivationRef)])
}
