use serde::{Deserialize, Serialize};

use crate::memory::Memory;
use crate::tensor::{Axis, Layout, TensorShape};
use crate::types::PrimitiveId;

/// Activation fused into a producing primitive or run standalone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationInfo {
    pub func: ActivationFunc,
    /// Negative-input slope for ReLU; 0 gives the plain variant.
    pub slope: f32,
}

impl ActivationInfo {
    pub fn relu() -> Self {
        Self { func: ActivationFunc::Relu, slope: 0.0 }
    }

    pub fn leaky_relu(slope: f32) -> Self {
        Self { func: ActivationFunc::Relu, slope }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationFunc {
    Relu,
    Sigmoid,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EltwiseMode {
    Sum,
    Sub,
    Max,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoftmaxDim {
    /// One group per (b, f, y) row.
    X,
    /// One group per (b, f) plane.
    Yx,
    /// One group per batch.
    Fyx,
    /// The whole tensor is a single group.
    Bfyx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolingMode {
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrnNorm {
    AcrossChannel,
    WithinChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsampleMode {
    Nearest,
    Bilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgMaxMinOut {
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvolutionParams {
    /// One weights primitive per split, each [ofm/split, ifm/split, ky, kx].
    pub weights: Vec<PrimitiveId>,
    /// One bias primitive per split, or empty for no bias.
    pub bias: Vec<PrimitiveId>,
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    /// Negative values pad the input; mirrors the device API convention.
    pub input_offset: (i32, i32),
    pub split: usize,
    pub with_activation: Option<ActivationInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeconvolutionParams {
    pub weights: Vec<PrimitiveId>,
    pub bias: Vec<PrimitiveId>,
    pub stride: (usize, usize),
    pub input_offset: (i32, i32),
    pub split: usize,
    pub with_activation: Option<ActivationInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullyConnectedParams {
    pub weights: PrimitiveId,
    pub bias: Option<PrimitiveId>,
    pub with_activation: Option<ActivationInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingParams {
    pub mode: PoolingMode,
    pub size: (usize, usize),
    pub stride: (usize, usize),
    pub input_offset: (i32, i32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxParams {
    pub dimension: SoftmaxDim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EltwiseParams {
    pub mode: EltwiseMode,
    pub with_activation: Option<ActivationInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationParams {
    pub info: ActivationInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatParams {
    pub axis: Axis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropParams {
    pub size: TensorShape,
    pub offsets: TensorShape,
}

/// How a reorder adjusts values while changing layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReorderSubtract {
    None,
    /// One value per feature, subtracted from every element of that feature.
    PerFeature(Vec<f32>),
    /// A mean tensor supplied by another primitive.
    Mean(PrimitiveId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderParams {
    pub output_layout: Layout,
    pub subtract: ReorderSubtract,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReshapeParams {
    pub output_shape: TensorShape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermuteParams {
    /// Destination axis for each of b, f, y, x.
    pub order: [usize; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrnParams {
    pub size: usize,
    pub k: f32,
    pub alpha: f32,
    pub beta: f32,
    pub norm_region: LrnNorm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeParams {
    /// Scale factors constant; one value, or one per feature.
    pub scale: PrimitiveId,
    pub across_spatial: bool,
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormParams {
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsamplingParams {
    pub scale: usize,
    pub mode: UpsampleMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorBoxParams {
    pub image_size: (usize, usize),
    pub min_sizes: Vec<f32>,
    pub max_sizes: Vec<f32>,
    pub aspect_ratios: Vec<f32>,
    pub flip: bool,
    pub clip: bool,
    pub variance: Vec<f32>,
    pub step_width: f32,
    pub step_height: f32,
    pub offset: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionYoloParams {
    pub coords: usize,
    pub classes: usize,
    pub num: usize,
    pub do_softmax: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiPoolingParams {
    pub pooled_size: (usize, usize),
    pub spatial_scale: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplerNmsParams {
    pub max_proposals: usize,
    pub iou_threshold: f32,
    pub min_box_size: usize,
    pub feature_stride: usize,
    pub pre_nms_topn: usize,
    pub post_nms_topn: usize,
    pub scales: Vec<f32>,
    pub ratios: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgMaxMinParams {
    pub out: ArgMaxMinOut,
    /// `None` reduces over the whole tensor.
    pub axis: Option<Axis>,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupTableParams {
    pub axis: Option<Axis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSelectParams {
    pub axis: Axis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanSubtractParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputLayoutParams {
    pub layout: Layout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataParams {
    pub memory: Memory,
}

/// A user-supplied kernel with its own source and dispatch geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomParams {
    pub source: String,
    pub entry_point: String,
    pub jit: Vec<(String, String)>,
    pub gws: [usize; 3],
    pub lws: Option<[usize; 3]>,
    pub output_layout: Layout,
}

/// Closed set of operator kinds a topology can hold. Per-kind behaviour
/// (output layout calculation, kernel parameter lowering) dispatches on
/// this tag rather than on an inheritance hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Activation(ActivationParams),
    ArgMaxMin(ArgMaxMinParams),
    BatchNorm(BatchNormParams),
    Concatenation(ConcatParams),
    Convolution(ConvolutionParams),
    Crop(CropParams),
    Custom(CustomParams),
    Data(DataParams),
    Deconvolution(DeconvolutionParams),
    Eltwise(EltwiseParams),
    FullyConnected(FullyConnectedParams),
    IndexSelect(IndexSelectParams),
    InputLayout(InputLayoutParams),
    LookupTable(LookupTableParams),
    Lrn(LrnParams),
    MeanSubtract(MeanSubtractParams),
    Normalize(NormalizeParams),
    Permute(PermuteParams),
    Pooling(PoolingParams),
    PriorBox(PriorBoxParams),
    RegionYolo(RegionYoloParams),
    Reorder(ReorderParams),
    Reshape(ReshapeParams),
    RoiPooling(RoiPoolingParams),
    Scale(ScaleParams),
    SimplerNms(SimplerNmsParams),
    Softmax(SoftmaxParams),
    Upsampling(UpsamplingParams),
}

impl PrimitiveKind {
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveKind::Activation(_) => "activation",
            PrimitiveKind::ArgMaxMin(_) => "arg_max_min",
            PrimitiveKind::BatchNorm(_) => "batch_norm",
            PrimitiveKind::Concatenation(_) => "concatenation",
            PrimitiveKind::Convolution(_) => "convolution",
            PrimitiveKind::Crop(_) => "crop",
            PrimitiveKind::Custom(_) => "custom",
            PrimitiveKind::Data(_) => "data",
            PrimitiveKind::Deconvolution(_) => "deconvolution",
            PrimitiveKind::Eltwise(_) => "eltwise",
            PrimitiveKind::FullyConnected(_) => "fully_connected",
            PrimitiveKind::IndexSelect(_) => "index_select",
            PrimitiveKind::InputLayout(_) => "input_layout",
            PrimitiveKind::LookupTable(_) => "lookup_table",
            PrimitiveKind::Lrn(_) => "lrn",
            PrimitiveKind::MeanSubtract(_) => "mean_subtract",
            PrimitiveKind::Normalize(_) => "normalize",
            PrimitiveKind::Permute(_) => "permute",
            PrimitiveKind::Pooling(_) => "pooling",
            PrimitiveKind::PriorBox(_) => "prior_box",
            PrimitiveKind::RegionYolo(_) => "region_yolo",
            PrimitiveKind::Reorder(_) => "reorder",
            PrimitiveKind::Reshape(_) => "reshape",
            PrimitiveKind::RoiPooling(_) => "roi_pooling",
            PrimitiveKind::Scale(_) => "scale",
            PrimitiveKind::SimplerNms(_) => "simpler_nms",
            PrimitiveKind::Softmax(_) => "softmax",
            PrimitiveKind::Upsampling(_) => "upsampling",
        }
    }

    /// Tensor dependencies referenced from parameters rather than from the
    /// visible input list: weights, biases, subtract means, scale factors.
    /// They are appended to a node's dependency edges in this order.
    pub fn hidden_inputs(&self) -> Vec<PrimitiveId> {
        match self {
            PrimitiveKind::Convolution(p) => {
                p.weights.iter().chain(p.bias.iter()).cloned().collect()
            }
            PrimitiveKind::Deconvolution(p) => {
                p.weights.iter().chain(p.bias.iter()).cloned().collect()
            }
            PrimitiveKind::FullyConnected(p) => std::iter::once(p.weights.clone())
                .chain(p.bias.iter().cloned())
                .collect(),
            PrimitiveKind::Reorder(p) => match &p.subtract {
                ReorderSubtract::Mean(id) => vec![id.clone()],
                _ => vec![],
            },
            PrimitiveKind::Normalize(p) => vec![p.scale.clone()],
            _ => vec![],
        }
    }

    /// Number of splits a grouped primitive expands into at execution.
    pub fn split(&self) -> usize {
        match self {
            PrimitiveKind::Convolution(p) => p.split.max(1),
            PrimitiveKind::Deconvolution(p) => p.split.max(1),
            _ => 1,
        }
    }
}
