use crate::errors::OxResult;
use crate::kernels::jit::{base_jit, group_macro};
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelPriority, KernelSelector,
    OptionalParams,
};
use crate::tensor::Axis;
use crate::topology::SoftmaxDim;

#[derive(Debug, Clone)]
pub struct SoftmaxKernelParams {
    pub base: BaseParams,
    pub dimension: SoftmaxDim,
}

/// (group axes, normalised axes) in outermost-first order.
pub fn dim_axes(dim: SoftmaxDim) -> (&'static [Axis], &'static [Axis]) {
    use Axis::*;
    match dim {
        SoftmaxDim::X => (&[Batch, Feature, Y], &[X]),
        SoftmaxDim::Yx => (&[Batch, Feature], &[Y, X]),
        SoftmaxDim::Fyx => (&[Batch], &[Feature, Y, X]),
        SoftmaxDim::Bfyx => (&[], &[Batch, Feature, Y, X]),
    }
}

fn group_counts(p: &SoftmaxKernelParams) -> (usize, usize) {
    let (group_axes, elem_axes) = dim_axes(p.dimension);
    let size = p.base.input(0).size;
    let groups: usize = group_axes.iter().map(|a| size.get(*a)).product();
    let elems: usize = elem_axes.iter().map(|a| size.get(*a)).product();
    (groups, elems)
}

fn softmax_jit(p: &SoftmaxKernelParams) -> crate::kernels::JitConstants {
    let (group_axes, elem_axes) = dim_axes(p.dimension);
    let (groups, elems) = group_counts(p);
    let mut jit = base_jit(&p.base);
    jit.add_int("GROUP_NUM", groups as i64);
    jit.add_int("GROUP_SIZE", elems as i64);
    let tag = match p.dimension {
        SoftmaxDim::X => "SOFTMAX_DIM_X",
        SoftmaxDim::Yx => "SOFTMAX_DIM_YX",
        SoftmaxDim::Fyx => "SOFTMAX_DIM_FYX",
        SoftmaxDim::Bfyx => "SOFTMAX_DIM_BFYX",
    };
    jit.add(tag, "1");
    jit.add("GROUP_ELEMENT(g, i)", group_macro(p.base.input(0), group_axes, elem_axes));
    jit.add(
        "OUTPUT_GROUP_ELEMENT(g, i)",
        group_macro(&p.base.output, group_axes, elem_axes),
    );
    jit
}

struct SoftmaxRef;

impl KernelBase<SoftmaxKernelParams> for SoftmaxRef {
    fn kernel_name(&self) -> &'static str {
        "softmax_ref"
    }

    fn supports(&self, p: &SoftmaxKernelParams) -> bool {
        p.base.input(0).simple() && p.base.output.data_type.is_float()
    }

    fn build(&self, p: &SoftmaxKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("softmax_ref", options.entry_point("softmax_ref"));
        kd.jit = softmax_jit(p);
        let (groups, elems) = group_counts(p);
        kd.gws = [groups.max(1), 1, 1];
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = (groups * elems * 3) as f32;
        Ok(kd)
    }
}

/// Work-group reduction variant for long normalisation spans; amortises
/// the max/sum passes across a local group.
struct SoftmaxItemsClassOptimized;

const OPT_LWS: usize = 64;

impl KernelBase<SoftmaxKernelParams> for SoftmaxItemsClassOptimized {
    fn kernel_name(&self) -> &'static str {
        "softmax_items_class_optimized"
    }

    fn supports(&self, p: &SoftmaxKernelParams) -> bool {
        let (_, elems) = group_counts(p);
        matches!(p.dimension, SoftmaxDim::Fyx | SoftmaxDim::Bfyx)
            && p.base.input(0).simple()
            && p.base.input(0).padding.is_zero()
            && p.base.output.data_type.is_float()
            && elems >= OPT_LWS
    }

    fn estimate(&self, _p: &SoftmaxKernelParams) -> KernelPriority {
        KernelPriority::Force(7)
    }

    fn build(&self, p: &SoftmaxKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new(
            "softmax_items_class_optimized",
            options.entry_point("softmax_items_class_optimized"),
        );
        kd.jit = softmax_jit(p);
        kd.jit.add_int("LWS_SIZE", OPT_LWS as i64);
        let (groups, elems) = group_counts(p);
        kd.gws = [groups * OPT_LWS, 1, 1];
        kd.lws = Some([OPT_LWS, 1, 1]);
        kd.arguments = vec![ArgumentKind::Input(0), ArgumentKind::Output];
        kd.estimated_time = (groups * elems * 3 / OPT_LWS) as f32;
        Ok(kd)
    }
}

pub fn selector() -> KernelSelector<SoftmaxKernelParams> {
    KernelSelector::new(
        "softmax",
        vec![Box::new(SoftmaxRef), Box::new(SoftmaxItemsClassOptimized)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Format, Layout, TensorShape};
    use crate::types::DataType;

    fn params(dim: SoftmaxDim, size: TensorShape) -> SoftmaxKernelParams {
        let layout = Layout::new(DataType::F32, Format::Bfyx, size);
        SoftmaxKernelParams {
            base: BaseParams::new(vec![layout.clone()], layout),
            dimension: dim,
        }
    }

    #[test]
    fn short_spans_take_the_reference_kernel() {
        let p = params(SoftmaxDim::Fyx, TensorShape::new(1, 10, 1, 1));
        let kd = selector().select(&p, &OptionalParams::default(), None).unwrap();
        assert_eq!(kd.template, "softmax_ref");
        assert_eq!(kd.jit.int("GROUP_NUM").unwrap(), 1);
        assert_eq!(kd.jit.int("GROUP_SIZE").unwrap(), 10);
    }

    #[test]
    fn long_spans_take_the_optimised_kernel() {
        let p = params(SoftmaxDim::Fyx, TensorShape::new(2, 1000, 1, 1));
        let kd = selector().select(&p, &OptionalParams::default(), None).unwrap();
        assert_eq!(kd.template, "softmax_items_class_optimized");
        assert_eq!(kd.lws, Some([OPT_LWS, 1, 1]));
    }
}
