use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, group_macro};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::tensor::Axis;
use crate::topology::ArgMaxMinOut;

#[derive(Debug, Clone)]
pub struct ArgMaxMinKernelParams {
    pub base: BaseParams,
    pub out: ArgMaxMinOut,
    pub axis: Option<Axis>,
    pub top_k: usize,
}

/// Group axes (everything not reduced) and reduced axes. A `None` axis
/// reduces the whole non-batch extent, one group per batch entry.
pub fn reduction_axes(axis: Option<Axis>) -> (Vec<Axis>, Vec<Axis>) {
    use Axis::*;
    match axis {
        Some(a) => (Axis::ALL.iter().copied().filter(|x| *x != a).collect(), vec![a]),
        None => (vec![Batch], vec![Feature, Y, X]),
    }
}

struct ArgMaxMinRef;

impl KernelBase<ArgMaxMinKernelParams> for ArgMaxMinRef {
    fn kernel_name(&self) -> &'static str {
        "arg_max_min_ref"
    }

    fn supports(&self, p: &ArgMaxMinKernelParams) -> bool {
        let (_, reduced) = reduction_axes(p.axis);
        let span: usize = reduced.iter().map(|a| p.base.input(0).size.get(*a)).product();
        p.base.input(0).simple() && p.top_k >= 1 && span >= p.top_k
    }

    fn build(&self, p: &ArgMaxMinKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("arg_max_min_ref", options.entry_point("arg_max_min_ref"));
        let (group_axes, reduced) = reduction_axes(p.axis);
        let input = p.base.input(0);
        let groups: usize = group_axes.iter().map(|a| input.size.get(*a)).product();
        let span: usize = reduced.iter().map(|a| input.size.get(*a)).product();

        kd.jit = base_jit(&p.base);
        kd.jit.add_int("ARG_MAX", matches!(p.out, ArgMaxMinOut::Max) as i64);
        kd.jit.add_int("TOP_K", p.top_k as i64);
        kd.jit.add_int("GROUP_NUM", groups as i64);
        kd.jit.add_int("AXIS_SIZE", span as i64);
        match p.axis {
            Some(Axis::Batch) => kd.jit.add("AXIS_BATCH", "1"),
            Some(Axis::Feature) => kd.jit.add("AXIS_FEATURE", "1"),
            Some(Axis::Y) => kd.jit.add("AXIS_Y", "1"),
            Some(Axis::X) => kd.jit.add("AXIS_X", "1"),
            None => kd.jit.add("AXIS_ALL", "1"),
        }
        kd.jit.add("GROUP_ELEMENT(g, i)", group_macro(input, &group_axes, &reduced));
        // the output's reduced extent is top_k, addressed the same way
        let out_reduced: Vec<Axis> = match p.axis {
            Some(a) => vec![a],
            None => vec![Axis::X],
        };
        kd.jit.add(
            "OUTPUT_GROUP_ELEMENT(g, i)",
            group_macro(&p.base.output, &group_axes, &out_reduced),
        );
        kd.gws = [groups.max(1), 1, 1];
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = (groups * span * p.top_k) as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<ArgMaxMinKernelParams> {
    KernelSelector::new("arg_max_min", vec![Box::new(ArgMaxMinRef)])
}
