use crate::errors::OxResult;
use crate::kernels::jit::base_jit;
use crate::kernels::{
    ArgumentKind, BaseParams, KernelBase, KernelData, KernelSelector, OptionalParams,
};
use crate::topology::SimplerNmsParams;

/// Inputs: class scores, bbox deltas, image info. Output: one
/// (batch, x0, y0, x1, y1) proposal per row.
#[derive(Debug, Clone)]
pub struct SimplerNmsKernelParams {
    pub base: BaseParams,
    pub nms: SimplerNmsParams,
}

struct SimplerNmsRef;

impl KernelBase<SimplerNmsKernelParams> for SimplerNmsRef {
    fn kernel_name(&self) -> &'static str {
        "simpler_nms_ref"
    }

    fn supports(&self, p: &SimplerNmsKernelParams) -> bool {
        p.base.inputs.len() == 3
            && !p.nms.scales.is_empty()
            && !p.nms.ratios.is_empty()
            && p.nms.post_nms_topn >= 1
    }

    fn build(&self, p: &SimplerNmsKernelParams, options: &OptionalParams) -> OxResult<KernelData> {
        let mut kd = KernelData::new("simpler_nms_ref", options.entry_point("simpler_nms_ref"));
        kd.jit = base_jit(&p.base);
        kd.jit.add_int("FEATURE_STRIDE", p.nms.feature_stride as i64);
        kd.jit.add_int("MIN_BOX_SIZE", p.nms.min_box_size as i64);
        kd.jit.add_int("PRE_NMS_TOPN", p.nms.pre_nms_topn as i64);
        kd.jit.add_int("POST_NMS_TOPN", p.nms.post_nms_topn as i64);
        kd.jit.add_float("IOU_THRESHOLD", p.nms.iou_threshold);
        kd.jit.add_int("SCALES_NUM", p.nms.scales.len() as i64);
        for (i, s) in p.nms.scales.iter().enumerate() {
            kd.jit.add_float(format!("SCALE_{i}"), *s);
        }
        kd.jit.add_int("RATIOS_NUM", p.nms.ratios.len() as i64);
        for (i, r) in p.nms.ratios.iter().enumerate() {
            kd.jit.add_float(format!("RATIO_{i}"), *r);
        }
        // initializer lists for the device-side anchor tables
        kd.jit.add("SCALES_INIT", float_list(&p.nms.scales));
        kd.jit.add("RATIOS_INIT", float_list(&p.nms.ratios));
        kd.gws = [1, 1, 1];
        kd.arguments = vec![
            ArgumentKind::Input(0),
            ArgumentKind::Input(1),
            ArgumentKind::Input(2),
            ArgumentKind::Output,
        ];
        kd.estimated_time = (p.nms.pre_nms_topn * p.nms.post_nms_topn) as f32;
        Ok(kd)
    }
}

fn float_list(values: &[f32]) -> String {
    let items: Vec<String> =
        values.iter().map(|v| crate::kernels::jit::float_code(*v)).collect();
    format!("{{{}}}", items.join(", "))
}

pub fn selector() -> KernelSelector<SimplerNmsKernelParams> {
    KernelSelector::new("simpler_nms", vec![Box::new(SimplerNmsRef)])
}
