use crate::errors::OxResult;
use crate::kernels::jit::base_jit;
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};

/// Inputs: feature map and a roi tensor of (batch, x0, y0, x1, y1)
/// records, one per output batch entry.
#[derive(Debug, Clone)]
pub struct RoiPoolingKernelParams {
    pub base: BaseParams,
    pub pooled_size: (usize, usize),
    pub spatial_scale: f32,
}

struct RoiPoolingRef;

impl KernelBase<RoiPoolingKernelParams> for RoiPoolingRef {
    fn kernel_name(&self) -> &'static str {
        "roi_pooling_ref"
    }

    fn supports(&self, p: &RoiPoolingKernelParams) -> bool {
        p.base.inputs.len() == 2
            && p.base.input(0).simple()
            && p.base.input(1).size.x >= 5
            && p.pooled_size.0 >= 1
            && p.pooled_size.1 >= 1
    }

    fn build(&self, p: &RoiPoolingKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("roi_pooling_ref", options.entry_point("roi_pooling_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.add_int("POOLED_HEIGHT", p.pooled_size.0 as i64);
        kd.jit.add_int("POOLED_WIDTH", p.pooled_size.1 as i64);
        kd.jit.add_float("SPATIAL_SCALE", p.spatial_scale);
        let out = p.base.output.size;
        kd.gws = [out.x.max(1), out.y.max(1), (out.batch * out.feature).max(1)];
        kd.arguments =
            vec![ArgumentKind::Input(0), ArgumentKind::Input(1), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<RoiPoolingKernelParams> {
    KernelSelector::new("roi_pooling", vec![Box::new(RoiPoolingRef)])
}
