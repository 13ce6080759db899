use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, filter_jit};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
    WeightsReorder,
};
use crate::tensor::{Format, Layout};

#[derive(Debug, Clone)]
pub struct FullyConnectedKernelParams {
    pub base: BaseParams,
    pub weights: Layout,
    pub bias_term: bool,
}

struct FullyConnectedRef;

impl KernelBase<FullyConnectedKernelParams> for FullyConnectedRef {
    fn kernel_name(&self) -> &'static str {
        "fully_connected_ref"
    }

    fn supports(&self, p: &FullyConnectedKernelParams) -> bool {
        let input = p.base.input(0);
        input.simple()
            && p.weights.size.feature == input.size.feature
            && p.weights.size.y == input.size.y
            && p.weights.size.x == input.size.x
    }

    fn build(
        &self,
        p: &FullyConnectedKernelParams,
        options: &OptionalParams,
    ) -> OxResult<KernelData> {
        let mut kd =
            KernelData::new("fully_connected_ref", options.entry_point("fully_connected_ref"));
        let weights = p.weights.transform(Format::Oiyx);
        kd.jit = base_jit(&p.base);
        kd.jit.merge(filter_jit("FILTER", &weights));
        kd.jit.add_int("BIAS_TERM", p.bias_term as i64);
        let out = p.base.output.size;
        kd.gws = [out.feature.max(1), out.batch.max(1), 1];
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output, ArgumentKind::Weights];
        if p.bias_term {
            kd.arguments.push(ArgumentKind::Bias);
        }
        if p.weights.format != Format::Oiyx {
            kd.weights_reorder = Some(WeightsReorder { target: weights });
        }
        kd.estimated_time = (p.base.output.logical_size() * p.weights.size.feature) as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<FullyConnectedKernelParams> {
    KernelSelector::new("fully_connected", vec![Box::new(FullyConnectedRef)])
}
