use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::topology::LrnNorm;

#[derive(Debug, Clone)]
pub struct LrnKernelParams {
    pub base: BaseParams,
    pub size: usize,
    pub k: f32,
    pub alpha: f32,
    pub beta: f32,
    pub norm_region: LrnNorm,
}

struct LrnRef;

impl KernelBase<LrnKernelParams> for LrnRef {
    fn kernel_name(&self) -> &'static str {
        "lrn_ref"
    }

    fn supports(&self, p: &LrnKernelParams) -> bool {
        p.size >= 1 && p.base.input(0).simple() && p.base.output.data_type.is_float()
    }

    fn build(&self, p: &LrnKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("lrn_ref", options.entry_point("lrn_ref"));
        kd.jit = base_jit(&p.base);
        let across = matches!(p.norm_region, LrnNorm::AcrossChannel);
        let local_elements = if across { p.size } else { p.size * p.size };
        kd.jit.add_int("LOCAL_SIZE", p.size as i64);
        kd.jit.add_int("LOCAL_ELEMENTS", local_elements as i64);
        kd.jit.add_int("ACROSS_CHANNEL", across as i64);
        kd.jit.add_float("K", p.k);
        kd.jit.add_float("ALPHA", p.alpha);
        kd.jit.add_float("BETA", p.beta);
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = (p.base.output.logical_size() * local_elements) as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<LrnKernelParams> {
    KernelSelector::new("lrn", vec![Box::new(LrnRef)])
}
