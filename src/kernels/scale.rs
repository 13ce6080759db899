use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element, tensor_jit};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};

/// Inputs: value tensor, scale tensor, optional bias tensor. Scale and
/// bias broadcast per axis by index wrap-around.
#[derive(Debug, Clone)]
pub struct ScaleKernelParams {
    pub base: BaseParams,
    pub bias_term: bool,
}

struct ScaleRef;

impl KernelBase<ScaleKernelParams> for ScaleRef {
    fn kernel_name(&self) -> &'static str {
        "scale_ref"
    }

    fn supports(&self, p: &ScaleKernelParams) -> bool {
        let wanted = if p.bias_term { 3 } else { 2 };
        p.base.inputs.len() == wanted && p.base.inputs.iter().all(|l| l.simple())
    }

    fn build(&self, p: &ScaleKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("scale_ref", options.entry_point("scale_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.merge(tensor_jit("SCALE", p.base.input(1)));
        kd.jit.add_int("BIAS_TERM", p.bias_term as i64);
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments =
            vec![ArgumentKind::Input(0), ArgumentKind::Input(1), ArgumentKind::Output];
        if p.bias_term {
            kd.arguments.push(ArgumentKind::Input(2));
        }
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<ScaleKernelParams> {
    KernelSelector::new("scale", vec![Box::new(ScaleRef)])
}
