use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::tensor::Axis;

/// One lowering per concatenated input: the program enqueues a copy kernel
/// for each, with the running axis offset baked in.
#[derive(Debug, Clone)]
pub struct ConcatKernelParams {
    pub base: BaseParams,
    pub axis: Axis,
    /// Sum of the axis extents of earlier inputs.
    pub axis_offset: usize,
    /// Which input of the concatenation this lowering copies.
    pub input_index: usize,
}

struct ConcatenationRef;

impl KernelBase<ConcatKernelParams> for ConcatenationRef {
    fn kernel_name(&self) -> &'static str {
        "concatenation_ref"
    }

    fn supports(&self, p: &ConcatKernelParams) -> bool {
        p.base.input(0).simple() && p.base.output.simple()
    }

    fn build(&self, p: &ConcatKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("concatenation_ref", options.entry_point("concatenation_ref"));
        // jit is emitted against the copied input, renamed to INPUT0
        let lowered = BaseParams::new(vec![p.base.input(0).clone()], p.base.output.clone());
        kd.jit = base_jit(&lowered);
        kd.jit.add_int("CONCAT_OFFSET", p.axis_offset as i64);
        for (name, axis) in [
            ("CONCAT_AXIS_BATCH", Axis::Batch),
            ("CONCAT_AXIS_FEATURE", Axis::Feature),
            ("CONCAT_AXIS_Y", Axis::Y),
            ("CONCAT_AXIS_X", Axis::X),
        ] {
            kd.jit.add_int(name, (axis == p.axis) as i64);
        }
        kd.gws = gws_per_element(p.base.input(0));
        kd.arguments = vec![ArgumentKind::Input(p.input_index), ArgumentKind::Output];
        kd.estimated_time = p.base.input(0).logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<ConcatKernelParams> {
    KernelSelector::new("concatenation", vec![Box::new(ConcatenationRef)])
}
