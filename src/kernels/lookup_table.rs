use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, group_macro};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::kernels::arg_max_min::reduction_axes;
use crate::tensor::Axis;

/// Inputs: value tensor and an index tensor (as produced by arg_max_min);
/// gathers the values behind each index.
#[derive(Debug, Clone)]
pub struct LookupTableKernelParams {
    pub base: BaseParams,
    pub axis: Option<Axis>,
}

struct LookupTableRef;

impl KernelBase<LookupTableKernelParams> for LookupTableRef {
    fn kernel_name(&self) -> &'static str {
        "lookup_table_ref"
    }

    fn supports(&self, p: &LookupTableKernelParams) -> bool {
        p.base.inputs.len() == 2 && p.base.input(0).simple() && p.base.input(1).simple()
    }

    fn build(&self, p: &LookupTableKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("lookup_table_ref", options.entry_point("lookup_table_ref"));
        let (group_axes, reduced) = reduction_axes(p.axis);
        let indices = p.base.input(1);
        let out_axis: Vec<Axis> = match p.axis {
            Some(a) => vec![a],
            None => vec![Axis::X],
        };
        let per_group: usize = out_axis.iter().map(|a| indices.size.get(*a)).product();

        kd.jit = base_jit(&p.base);
        kd.jit.add_int("OUTPUT_ELEMENTS", p.base.output.logical_size() as i64);
        kd.jit.add_int("AXIS_OUT_SIZE", per_group.max(1) as i64);
        match p.axis {
            Some(Axis::Batch) => kd.jit.add("AXIS_BATCH", "1"),
            Some(Axis::Feature) => kd.jit.add("AXIS_FEATURE", "1"),
            Some(Axis::Y) => kd.jit.add("AXIS_Y", "1"),
            Some(Axis::X) => kd.jit.add("AXIS_X", "1"),
            None => kd.jit.add("AXIS_ALL", "1"),
        }
        kd.jit.add(
            "GROUP_ELEMENT(g, i)",
            group_macro(p.base.input(0), &group_axes, &reduced),
        );
        kd.gws = [p.base.output.logical_size().max(1), 1, 1];
        kd.arguments =
            vec![ArgumentKind::Input(0), ArgumentKind::Input(1), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<LookupTableKernelParams> {
    KernelSelector::new("lookup_table", vec![Box::new(LookupTableRef)])
}
