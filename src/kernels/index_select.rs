use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::tensor::Axis;
use crate::types::DataType;

/// Inputs: value tensor and an i32 index vector gathered along `axis`.
#[derive(Debug, Clone)]
pub struct IndexSelectKernelParams {
    pub base: BaseParams,
    pub axis: Axis,
}

struct IndexSelectRef;

impl KernelBase<IndexSelectKernelParams> for IndexSelectRef {
    fn kernel_name(&self) -> &'static str {
        "index_select_ref"
    }

    fn supports(&self, p: &IndexSelectKernelParams) -> bool {
        p.base.inputs.len() == 2
            && p.base.input(0).simple()
            && p.base.input(1).data_type == DataType::I32
    }

    fn build(&self, p: &IndexSelectKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("index_select_ref", options.entry_point("index_select_ref"));
        kd.jit = base_jit(&p.base);
        for (name, axis) in [
            ("AXIS_BATCH", Axis::Batch),
            ("AXIS_FEATURE", Axis::Feature),
            ("AXIS_Y", Axis::Y),
            ("AXIS_X", Axis::X),
        ] {
            kd.jit.add_int(name, (axis == p.axis) as i64);
        }
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments =
            vec![ArgumentKind::Input(0), ArgumentKind::Input(1), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<IndexSelectKernelParams> {
    KernelSelector::new("index_select", vec![Box::new(IndexSelectRef)])
}
