use crate::errors::OxResult;
use crate::kernels::jit::base_jit;
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};

/// Dependencies: value tensor, then the trained scale-factor constant
/// (one value, or one per feature).
#[derive(Debug, Clone)]
pub struct NormalizeKernelParams {
    pub base: BaseParams,
    pub across_spatial: bool,
    pub epsilon: f32,
}

struct NormalizeRef;

impl KernelBase<NormalizeKernelParams> for NormalizeRef {
    fn kernel_name(&self) -> &'static str {
        "normalize_ref"
    }

    fn supports(&self, p: &NormalizeKernelParams) -> bool {
        if p.base.inputs.len() != 2 || !p.base.input(0).simple() {
            return false;
        }
        let scale = p.base.input(1);
        scale.logical_size() == 1 || scale.size.feature == p.base.input(0).size.feature
    }

    fn build(&self, p: &NormalizeKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("normalize_ref", options.entry_point("normalize_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.add_int("ACROSS_SPATIAL", p.across_spatial as i64);
        kd.jit.add_int("SCALE_PER_FEATURE", (p.base.input(1).logical_size() > 1) as i64);
        kd.jit.add_float("EPSILON", p.epsilon);
        let s = p.base.output.size;
        kd.gws = [s.x.max(1), s.y.max(1), s.batch.max(1)];
        kd.arguments =
            vec![ArgumentKind::Input(0), ArgumentKind::Output, ArgumentKind::Input(1)];
        kd.estimated_time = (p.base.output.logical_size() * s.feature) as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<NormalizeKernelParams> {
    KernelSelector::new("normalize", vec![Box::new(NormalizeRef)])
}
