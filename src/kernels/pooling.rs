use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::topology::PoolingMode;

#[derive(Debug, Clone)]
pub struct PoolingKernelParams {
    pub base: BaseParams,
    pub mode: PoolingMode,
    pub size: (usize, usize),
    pub stride: (usize, usize),
    pub input_offset: (i32, i32),
}

struct PoolingRef;

impl KernelBase<PoolingKernelParams> for PoolingRef {
    fn kernel_name(&self) -> &'static str {
        "pooling_ref"
    }

    fn supports(&self, p: &PoolingKernelParams) -> bool {
        p.base.input(0).simple()
            && p.size.0 >= 1
            && p.size.1 >= 1
            && p.stride.0 >= 1
            && p.stride.1 >= 1
    }

    fn build(&self, p: &PoolingKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("pooling_ref", options.entry_point("pooling_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.add_int("POOL_MAX", matches!(p.mode, PoolingMode::Max) as i64);
        kd.jit.add_int("POOL_SIZE_Y", p.size.0 as i64);
        kd.jit.add_int("POOL_SIZE_X", p.size.1 as i64);
        kd.jit.add_int("STRIDE_Y", p.stride.0 as i64);
        kd.jit.add_int("STRIDE_X", p.stride.1 as i64);
        kd.jit.add_int("INPUT_OFFSET_Y", p.input_offset.0 as i64);
        kd.jit.add_int("INPUT_OFFSET_X", p.input_offset.1 as i64);
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = (p.base.output.logical_size() * p.size.0 * p.size.1) as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<PoolingKernelParams> {
    KernelSelector::new("pooling", vec![Box::new(PoolingRef)])
}
