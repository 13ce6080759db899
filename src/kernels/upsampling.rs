use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::topology::UpsampleMode;

#[derive(Debug, Clone)]
pub struct UpsamplingKernelParams {
    pub base: BaseParams,
    pub scale: usize,
    pub mode: UpsampleMode,
}

struct UpsamplingRef;

impl KernelBase<UpsamplingKernelParams> for UpsamplingRef {
    fn kernel_name(&self) -> &'static str {
        "upsampling_ref"
    }

    fn supports(&self, p: &UpsamplingKernelParams) -> bool {
        p.scale >= 1 && p.base.input(0).simple() && p.base.output.simple()
    }

    fn build(&self, p: &UpsamplingKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("upsampling_ref", options.entry_point("upsampling_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.add_int("SCALE", p.scale as i64);
        kd.jit.add_int("BILINEAR", matches!(p.mode, UpsampleMode::Bilinear) as i64);
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<UpsamplingKernelParams> {
    KernelSelector::new("upsampling", vec![Box::new(UpsamplingRef)])
}
