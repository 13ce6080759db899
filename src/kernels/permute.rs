use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};

#[derive(Debug, Clone)]
pub struct PermuteKernelParams {
    pub base: BaseParams,
    pub order: [usize; 4],
}

struct PermuteRef;

impl KernelBase<PermuteKernelParams> for PermuteRef {
    fn kernel_name(&self) -> &'static str {
        "permute_ref"
    }

    fn supports(&self, p: &PermuteKernelParams) -> bool {
        let mut seen = [false; 4];
        for &o in &p.order {
            if o > 3 || seen[o] {
                return false;
            }
            seen[o] = true;
        }
        p.base.input(0).simple() && p.base.output.simple()
    }

    fn build(&self, p: &PermuteKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("permute_ref", options.entry_point("permute_ref"));
        kd.jit = base_jit(&p.base);
        // order[i] names which source axis lands at destination position i
        for (i, &o) in p.order.iter().enumerate() {
            kd.jit.add_int(format!("PERMUTE_ORDER_{i}"), o as i64);
        }
        kd.gws = gws_per_element(p.base.input(0));
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<PermuteKernelParams> {
    KernelSelector::new("permute", vec![Box::new(PermuteRef)])
}
