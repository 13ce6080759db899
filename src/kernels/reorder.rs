use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, float_code, gws_per_element, tensor_jit};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::tensor::Layout;

#[derive(Debug, Clone)]
pub enum ReorderSubtractLowered {
    None,
    PerFeature(Vec<f32>),
    /// Layout of the mean dependency, bound as the second input.
    Mean(Layout),
}

#[derive(Debug, Clone)]
pub struct ReorderKernelParams {
    pub base: BaseParams,
    pub subtract: ReorderSubtractLowered,
}

struct ReorderRef;

impl KernelBase<ReorderKernelParams> for ReorderRef {
    fn kernel_name(&self) -> &'static str {
        "reorder_ref"
    }

    fn supports(&self, p: &ReorderKernelParams) -> bool {
        let input = p.base.input(0);
        // blocked targets go through the build-time weights path
        input.simple() && p.base.output.simple() && input.size == p.base.output.size
    }

    fn build(&self, p: &ReorderKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("reorder_ref", options.entry_point("reorder_ref"));
        kd.jit = base_jit(&p.base);
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        match &p.subtract {
            ReorderSubtractLowered::None => {
                kd.jit.add_int("SUBTRACT_PER_FEATURE", 0);
                kd.jit.add_int("SUBTRACT_MEAN_MEMORY", 0);
            }
            ReorderSubtractLowered::PerFeature(values) => {
                kd.jit.add_int("SUBTRACT_PER_FEATURE", 1);
                kd.jit.add_int("SUBTRACT_MEAN_MEMORY", 0);
                // nested ternary chain indexed by feature
                let mut expr = String::from("(");
                for (f, v) in values.iter().enumerate() {
                    expr.push_str(&format!("(f) == {f} ? {} : ", float_code(*v)));
                }
                expr.push_str("0.0f)");
                kd.jit.add("SUBTRACT_VALUE(f)", expr);
                kd.jit.add_int("SUBTRACT_VAL_COUNT", values.len() as i64);
                for (f, v) in values.iter().enumerate() {
                    kd.jit.add_float(format!("SUBTRACT_VAL_{f}"), *v);
                }
            }
            ReorderSubtractLowered::Mean(mean) => {
                kd.jit.add_int("SUBTRACT_PER_FEATURE", 0);
                kd.jit.add_int("SUBTRACT_MEAN_MEMORY", 1);
                kd.jit.merge(tensor_jit("MEAN", mean));
                kd.arguments.push(ArgumentKind::Input(1));
            }
        }
        kd.gws = gws_per_element(p.base.input(0));
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<ReorderKernelParams> {
    KernelSelector::new("reorder", vec![Box::new(ReorderRef)])
}
