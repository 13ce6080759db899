use crate::errors::OxResult;
use crate::kernels::jit::base_jit;
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};

#[derive(Debug, Clone)]
pub struct RegionYoloKernelParams {
    pub base: BaseParams,
    pub coords: usize,
    pub classes: usize,
    pub num: usize,
    pub do_softmax: bool,
}

struct RegionYoloRef;

impl KernelBase<RegionYoloKernelParams> for RegionYoloRef {
    fn kernel_name(&self) -> &'static str {
        "region_yolo_ref"
    }

    fn supports(&self, p: &RegionYoloKernelParams) -> bool {
        let needed = p.num * (p.coords + p.classes + 1);
        p.base.input(0).simple() && p.base.input(0).size.feature >= needed
    }

    fn build(&self, p: &RegionYoloKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("region_yolo_ref", options.entry_point("region_yolo_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.add_int("COORDS", p.coords as i64);
        kd.jit.add_int("CLASSES", p.classes as i64);
        kd.jit.add_int("ANCHOR_NUM", p.num as i64);
        kd.jit.add_int("DO_SOFTMAX", p.do_softmax as i64);
        let s = p.base.input(0).size;
        kd.gws = [s.x.max(1), s.y.max(1), (s.batch * p.num).max(1)];
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<RegionYoloKernelParams> {
    KernelSelector::new("region_yolo", vec![Box::new(RegionYoloRef)])
}
