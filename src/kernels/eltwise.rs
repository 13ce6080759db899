use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, gws_per_element};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::topology::EltwiseMode;

#[derive(Debug, Clone)]
pub struct EltwiseKernelParams {
    pub base: BaseParams,
    pub mode: EltwiseMode,
}

struct EltwiseRef;

impl KernelBase<EltwiseKernelParams> for EltwiseRef {
    fn kernel_name(&self) -> &'static str {
        "eltwise_ref"
    }

    fn supports(&self, p: &EltwiseKernelParams) -> bool {
        p.base.inputs.len() == 2
            && p.base.input(0).simple()
            && p.base.input(1).simple()
            && p.base.input(0).size == p.base.input(1).size
            && p.base.input(0).data_type == p.base.input(1).data_type
    }

    fn build(&self, p: &EltwiseKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("eltwise_ref", options.entry_point("eltwise_ref"));
        kd.jit = base_jit(&p.base);
        let mode = match p.mode {
            EltwiseMode::Sum => "ELTWISE_MODE_SUM",
            EltwiseMode::Sub => "ELTWISE_MODE_SUB",
            EltwiseMode::Max => "ELTWISE_MODE_MAX",
            EltwiseMode::Prod => "ELTWISE_MODE_PROD",
        };
        kd.jit.add(mode, "1");
        kd.gws = gws_per_element(&p.base.output);
        kd.arguments =
            vec![ArgumentKind::Input(0), ArgumentKind::Input(1), ArgumentKind::Output];
        kd.estimated_time = p.base.output.logical_size() as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<EltwiseKernelParams> {
    KernelSelector::new("eltwise", vec![Box::new(EltwiseRef)])
}
