use crate::errors::OxResult;
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::topology::CustomParams;

/// Pass-through lowering for a user-supplied kernel: the caller provides
/// source, entry point, jit table and dispatch geometry; the pipeline only
/// wires arguments and compilation.
#[derive(Debug, Clone)]
pub struct CustomKernelParams {
    pub base: BaseParams,
    pub desc: CustomParams,
}

struct CustomKernel;

impl KernelBase<CustomKernelParams> for CustomKernel {
    fn kernel_name(&self) -> &'static str {
        "custom"
    }

    fn supports(&self, p: &CustomKernelParams) -> bool {
        !p.desc.source.is_empty() && !p.desc.entry_point.is_empty()
    }

    fn build(&self, p: &CustomKernelParams, _options: &OptionalParams) -> OxResult<KernelData> {
        // entry point is the user's, never decorated
        let mut kd = KernelData::new("custom", p.desc.entry_point.clone());
        kd.custom_source = Some(p.desc.source.clone());
        for (name, value) in &p.desc.jit {
            kd.jit.add(name.clone(), value.clone());
        }
        kd.gws = p.desc.gws;
        kd.lws = p.desc.lws;
        kd.arguments = (0..p.base.inputs.len()).map(ArgumentKind::Input).collect();
        kd.arguments.push(ArgumentKind::Output);
        kd.estimated_time = 0.0;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<CustomKernelParams> {
    KernelSelector::new("custom", vec![Box::new(CustomKernel)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OxError;
    use crate::tensor::{Format, Layout, TensorShape};
    use crate::types::DataType;

    fn params(source: &str) -> CustomKernelParams {
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 1, 2, 2));
        CustomKernelParams {
            base: BaseParams::new(vec![layout.clone()], layout.clone()),
            desc: CustomParams {
                source: source.into(),
                entry_point: "double_values".into(),
                jit: vec![("SCALE".into(), "2.0f".into())],
                gws: [4, 1, 1],
                lws: None,
                output_layout: layout,
            },
        }
    }

    #[test]
    fn build_carries_user_source_and_arguments() {
        let kd = selector()
            .select(
                &params("__kernel void double_values(__global const float* in, __global float* out) {}"),
                &OptionalParams::default(),
                None,
            )
            .unwrap();
        assert_eq!(kd.entry_point, "double_values");
        assert!(kd.custom_source.as_deref().unwrap().contains("double_values"));
        assert_eq!(kd.gws, [4, 1, 1]);
        assert_eq!(kd.arguments, vec![ArgumentKind::Input(0), ArgumentKind::Output]);
        assert_eq!(kd.jit.get("SCALE"), Some("2.0f"));
    }

    #[test]
    fn entry_point_is_never_decorated() {
        let opts = OptionalParams {
            meaningful_kernel_names: true,
            primitive_id: "my_custom_op".into(),
        };
        let kd = selector()
            .select(&params("__kernel void double_values() {}"), &opts, None)
            .unwrap();
        assert_eq!(kd.entry_point, "double_values");
    }

    #[test]
    fn empty_source_is_rejected() {
        let err = selector().select(&params(""), &OptionalParams::default(), None).unwrap_err();
        assert!(matches!(err, OxError::UnsupportedConfiguration(_)));
    }
}
