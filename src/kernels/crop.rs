use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::tensor::TensorShape;

#[derive(Debug, Clone)]
pub struct CropKernelParams {
    pub base: BaseParams,
    pub offsets: TensorShape,
}

struct CropRef;

impl KernelBase<CropKernelParams> for CropRef {
    fn kernel_name(&self) -> &'static str {
        "crop_ref"
    }

    fn supports(&self, p: &CropKernelParams) -> bool {
        let input = p.base.input(0);
        let end = p.base.output.size.add(&p.offsets);
        p.base.input(0).simple()
            && end.batch <= input.size.batch
            && end.feature <= input.size.feature
            && end.y <= input.size.y
            && end.x <= input.size.x
    }

    fn build(&self, p: &CropKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("crop_ref", options.entry_point("crop_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.add_int("CROP_OFFSET_BATCH", p.offsets.batch as i64);
        kd.jit.add_int("CROP_OFFSET_FEATURE", p.offsets.feature as i64);
        kd.jit.add_int("CROP_OFFSET_Y", p.offsets.y as i64);
        kd.jit.add_int("CROP_OFFSET_X", p.offsets.x as i64);
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<CropKernelParams> {
    KernelSelector::new("crop", vec![Box::new(CropRef)])
}
