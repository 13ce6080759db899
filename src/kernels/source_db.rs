//! Process-wide immutable database of kernel source templates. Templates
//! reference geometry exclusively through jitted preprocessor constants,
//! so a single template serves every shape, layout and element type its
//! candidate accepts.

use crate::errors::{OxError, OxResult};

/// Looks up a template by name.
pub fn get(name: &str) -> OxResult<&'static str> {
    TEMPLATES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, src)| *src)
        .ok_or_else(|| OxError::CompileError { log: format!("unknown kernel template '{name}'") })
}

pub fn names() -> impl Iterator<Item = &'static str> {
    TEMPLATES.iter().map(|(n, _)| *n)
}

const ACTIVATION_HELPER: &str = r#"
#if FUSED_ACTIVATION
#   if defined ACTIVATION_RELU
#       define ACTIVATION(v) ((v) > UNIT_VAL_ZERO ? (v) : (v) * NEGATIVE_SLOPE)
#   elif defined ACTIVATION_SIGMOID
#       define ACTIVATION(v) (UNIT_VAL_ONE / (UNIT_VAL_ONE + exp(-(v))))
#   else
#       define ACTIVATION(v) (tanh(v))
#   endif
#else
#   define ACTIVATION(v) (v)
#endif
#define INPUT0_GET_INDEX(b, f, y, x) (INPUT0_OFFSET + (b)*INPUT0_PITCH_BATCH + (f)*INPUT0_PITCH_FEATURE + (y)*INPUT0_PITCH_Y + (x)*INPUT0_PITCH_X)
#define OUTPUT_GET_INDEX(b, f, y, x) (OUTPUT_OFFSET + (b)*OUTPUT_PITCH_BATCH + (f)*OUTPUT_PITCH_FEATURE + (y)*OUTPUT_PITCH_Y + (x)*OUTPUT_PITCH_X)
"#;

static TEMPLATES: &[(&str, &str)] = &[
    ("activation_ref", ACTIVATION_REF),
    ("arg_max_min_ref", ARG_MAX_MIN_REF),
    ("batch_norm_ref", BATCH_NORM_REF),
    ("concatenation_ref", CONCATENATION_REF),
    ("convolution_ref", CONVOLUTION_REF),
    ("convolution_bfyx_os_iyx_osv16", CONVOLUTION_BLOCKED),
    ("convolution_yxfb_oiyx_b8", CONVOLUTION_YXFB),
    ("crop_ref", CROP_REF),
    ("deconvolution_ref", DECONVOLUTION_REF),
    ("eltwise_ref", ELTWISE_REF),
    ("fully_connected_ref", FULLY_CONNECTED_REF),
    ("index_select_ref", INDEX_SELECT_REF),
    ("lookup_table_ref", LOOKUP_TABLE_REF),
    ("lrn_ref", LRN_REF),
    ("mean_subtract_ref", MEAN_SUBTRACT_REF),
    ("normalize_ref", NORMALIZE_REF),
    ("permute_ref", PERMUTE_REF),
    ("pooling_ref", POOLING_REF),
    ("region_yolo_ref", REGION_YOLO_REF),
    ("reorder_ref", REORDER_REF),
    ("roi_pooling_ref", ROI_POOLING_REF),
    ("scale_ref", SCALE_REF),
    ("simpler_nms_ref", SIMPLER_NMS_REF),
    ("softmax_ref", SOFTMAX_REF),
    ("softmax_items_class_optimized", SOFTMAX_ITEMS_CLASS),
    ("upsampling_ref", UPSAMPLING_REF),
];

const ACTIVATION_REF: &str = r#"
KERNEL_HEADER
__kernel void activation_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    output[OUTPUT_GET_INDEX(b, f, y, x)] = ACTIVATION(input[INPUT0_GET_INDEX(b, f, y, x)]);
}
"#;

const ARG_MAX_MIN_REF: &str = r#"
KERNEL_HEADER
// One work item per output group; scans the reduced axis serially and
// writes the indices of the TOP_K extreme values.
__kernel void arg_max_min_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint group = get_global_id(0);
    if (group >= GROUP_NUM) return;
    for (uint k = 0; k < TOP_K; ++k) {
        uint best = 0;
        UNIT_TYPE best_val = ARG_MAX ? -UNIT_VAL_MAX : UNIT_VAL_MAX;
        for (uint i = 0; i < AXIS_SIZE; ++i) {
            UNIT_TYPE v = input[GROUP_ELEMENT(group, i)];
            bool better = ARG_MAX ? (v > best_val) : (v < best_val);
            bool taken = false;
            for (uint p = 0; p < k; ++p)
                taken |= (output[OUTPUT_GROUP_ELEMENT(group, p)] == (UNIT_TYPE)i);
            if (better && !taken) { best_val = v; best = i; }
        }
        output[OUTPUT_GROUP_ELEMENT(group, k)] = (UNIT_TYPE)best;
    }
}
"#;

const BATCH_NORM_REF: &str = r#"
KERNEL_HEADER
__kernel void batch_norm_ref(__global const UNIT_TYPE* input,
                             __global const UNIT_TYPE* mean,
                             __global const UNIT_TYPE* variance,
                             __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    UNIT_TYPE v = input[INPUT0_GET_INDEX(b, f, y, x)];
    output[OUTPUT_GET_INDEX(b, f, y, x)] =
        (v - mean[f]) / sqrt(variance[f] + EPSILON);
}
"#;

const CONCATENATION_REF: &str = r#"
KERNEL_HEADER
// Copies one input into its slot of the concatenated output. The host
// enqueues this once per input with the running axis offset jitted in.
__kernel void concatenation_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    const uint ob = b + (CONCAT_AXIS_BATCH ? CONCAT_OFFSET : 0);
    const uint of = f + (CONCAT_AXIS_FEATURE ? CONCAT_OFFSET : 0);
    const uint oy = y + (CONCAT_AXIS_Y ? CONCAT_OFFSET : 0);
    const uint ox = x + (CONCAT_AXIS_X ? CONCAT_OFFSET : 0);
    output[OUTPUT_GET_INDEX(ob, of, oy, ox)] = input[INPUT0_GET_INDEX(b, f, y, x)];
}
"#;

const CONVOLUTION_REF: &str = r#"
KERNEL_HEADER
#define FILTER_GET_INDEX(o, i, y, x) (FILTER_OFFSET + (o)*FILTER_PITCH_OFM + (i)*FILTER_PITCH_IFM + (y)*FILTER_PITCH_Y + (x)*FILTER_PITCH_X)
__kernel void convolution_ref(__global const UNIT_TYPE* input,
                              __global UNIT_TYPE* output,
                              __global const UNIT_TYPE* weights,
#if BIAS_TERM
                              __global const UNIT_TYPE* bias,
#endif
                              uint split_idx)
{
    const uint ox = get_global_id(0);
    const uint oy = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / FILTER_OFM_NUM;
    const uint ofm = bf % FILTER_OFM_NUM;
    if (ox >= OUTPUT_SIZE_X) return;

    const uint in_feature_base = split_idx * FILTER_IFM_NUM;
    const uint out_feature = split_idx * FILTER_OFM_NUM + ofm;
    UNIT_TYPE acc = UNIT_VAL_ZERO;
    for (uint ifm = 0; ifm < FILTER_IFM_NUM; ++ifm) {
        for (uint ky = 0; ky < FILTER_SIZE_Y; ++ky) {
            for (uint kx = 0; kx < FILTER_SIZE_X; ++kx) {
                const int iy = (int)(oy * STRIDE_Y) + (int)(ky * DILATION_Y) + INPUT_OFFSET_Y;
                const int ix = (int)(ox * STRIDE_X) + (int)(kx * DILATION_X) + INPUT_OFFSET_X;
                if (iy < 0 || iy >= INPUT0_SIZE_Y || ix < 0 || ix >= INPUT0_SIZE_X) continue;
                acc += input[INPUT0_GET_INDEX(b, in_feature_base + ifm, iy, ix)]
                     * weights[FILTER_GET_INDEX(ofm, ifm, ky, kx)];
            }
        }
    }
#if BIAS_TERM
    acc += bias[ofm];
#endif
    output[OUTPUT_GET_INDEX(b, out_feature, oy, ox)] = ACTIVATION(acc);
}
"#;

const CONVOLUTION_BLOCKED: &str = r#"
KERNEL_HEADER
// Weights reordered to os_iyx_osv16: consecutive output features sit in
// 16-wide blocks, giving coalesced filter reads per sub-group.
#define FILTER_GET_INDEX(o, i, y, x) \
    ((((o) / 16) * FILTER_IFM_NUM * FILTER_SIZE_Y * FILTER_SIZE_X \
      + (i) * FILTER_SIZE_Y * FILTER_SIZE_X + (y) * FILTER_SIZE_X + (x)) * 16 + (o) % 16)
__kernel void convolution_bfyx_os_iyx_osv16(__global const UNIT_TYPE* input,
                                            __global UNIT_TYPE* output,
                                            __global const UNIT_TYPE* weights,
#if BIAS_TERM
                                            __global const UNIT_TYPE* bias,
#endif
                                            uint split_idx)
{
    const uint ox = get_global_id(0);
    const uint oy = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / FILTER_OFM_NUM;
    const uint ofm = bf % FILTER_OFM_NUM;
    if (ox >= OUTPUT_SIZE_X) return;

    const uint in_feature_base = split_idx * FILTER_IFM_NUM;
    const uint out_feature = split_idx * FILTER_OFM_NUM + ofm;
    UNIT_TYPE acc = UNIT_VAL_ZERO;
    for (uint ifm = 0; ifm < FILTER_IFM_NUM; ++ifm) {
        for (uint ky = 0; ky < FILTER_SIZE_Y; ++ky) {
            for (uint kx = 0; kx < FILTER_SIZE_X; ++kx) {
                const int iy = (int)(oy * STRIDE_Y) + (int)(ky * DILATION_Y) + INPUT_OFFSET_Y;
                const int ix = (int)(ox * STRIDE_X) + (int)(kx * DILATION_X) + INPUT_OFFSET_X;
                if (iy < 0 || iy >= INPUT0_SIZE_Y || ix < 0 || ix >= INPUT0_SIZE_X) continue;
                acc += input[INPUT0_GET_INDEX(b, in_feature_base + ifm, iy, ix)]
                     * weights[FILTER_GET_INDEX(ofm, ifm, ky, kx)];
            }
        }
    }
#if BIAS_TERM
    acc += bias[ofm];
#endif
    output[OUTPUT_GET_INDEX(b, out_feature, oy, ox)] = ACTIVATION(acc);
}
"#;

const CONVOLUTION_YXFB: &str = r#"
KERNEL_HEADER
#define FILTER_GET_INDEX(o, i, y, x) (FILTER_OFFSET + (o)*FILTER_PITCH_OFM + (i)*FILTER_PITCH_IFM + (y)*FILTER_PITCH_Y + (x)*FILTER_PITCH_X)
// Activations in yxfb: batch has pitch 1, so the accumulator loop issues
// batch-coalesced loads. Selection routes batched runs here and reorders
// the input into yxfb first when needed.
__kernel void convolution_yxfb_oiyx_b8(__global const UNIT_TYPE* input,
                                       __global UNIT_TYPE* output,
                                       __global const UNIT_TYPE* weights,
#if BIAS_TERM
                                       __global const UNIT_TYPE* bias,
#endif
                                       uint split_idx)
{
    const uint ox = get_global_id(0);
    const uint oy = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / FILTER_OFM_NUM;
    const uint ofm = bf % FILTER_OFM_NUM;
    if (ox >= OUTPUT_SIZE_X) return;

    const uint in_feature_base = split_idx * FILTER_IFM_NUM;
    const uint out_feature = split_idx * FILTER_OFM_NUM + ofm;
    UNIT_TYPE acc = UNIT_VAL_ZERO;
    for (uint ifm = 0; ifm < FILTER_IFM_NUM; ++ifm) {
        for (uint ky = 0; ky < FILTER_SIZE_Y; ++ky) {
            for (uint kx = 0; kx < FILTER_SIZE_X; ++kx) {
                const int iy = (int)(oy * STRIDE_Y) + (int)(ky * DILATION_Y) + INPUT_OFFSET_Y;
                const int ix = (int)(ox * STRIDE_X) + (int)(kx * DILATION_X) + INPUT_OFFSET_X;
                if (iy < 0 || iy >= INPUT0_SIZE_Y || ix < 0 || ix >= INPUT0_SIZE_X) continue;
                acc += input[INPUT0_GET_INDEX(b, in_feature_base + ifm, iy, ix)]
                     * weights[FILTER_GET_INDEX(ofm, ifm, ky, kx)];
            }
        }
    }
#if BIAS_TERM
    acc += bias[ofm];
#endif
    output[OUTPUT_GET_INDEX(b, out_feature, oy, ox)] = ACTIVATION(acc);
}
"#;

const CROP_REF: &str = r#"
KERNEL_HEADER
__kernel void crop_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / OUTPUT_FEATURE_NUM;
    const uint f = bf % OUTPUT_FEATURE_NUM;
    if (x >= OUTPUT_SIZE_X) return;
    output[OUTPUT_GET_INDEX(b, f, y, x)] =
        input[INPUT0_GET_INDEX(b + CROP_OFFSET_BATCH, f + CROP_OFFSET_FEATURE,
                               y + CROP_OFFSET_Y, x + CROP_OFFSET_X)];
}
"#;

const DECONVOLUTION_REF: &str = r#"
KERNEL_HEADER
#define FILTER_GET_INDEX(o, i, y, x) (FILTER_OFFSET + (o)*FILTER_PITCH_OFM + (i)*FILTER_PITCH_IFM + (y)*FILTER_PITCH_Y + (x)*FILTER_PITCH_X)
// Transposed convolution: every output pixel gathers the input positions
// whose forward stride lands on it.
__kernel void deconvolution_ref(__global const UNIT_TYPE* input,
                                __global UNIT_TYPE* output,
                                __global const UNIT_TYPE* weights,
#if BIAS_TERM
                                __global const UNIT_TYPE* bias,
#endif
                                uint split_idx)
{
    const uint ox = get_global_id(0);
    const uint oy = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / FILTER_OFM_NUM;
    const uint ofm = bf % FILTER_OFM_NUM;
    if (ox >= OUTPUT_SIZE_X) return;

    const uint in_feature_base = split_idx * FILTER_IFM_NUM;
    const uint out_feature = split_idx * FILTER_OFM_NUM + ofm;
    UNIT_TYPE acc = UNIT_VAL_ZERO;
    for (uint ifm = 0; ifm < FILTER_IFM_NUM; ++ifm) {
        for (uint ky = 0; ky < FILTER_SIZE_Y; ++ky) {
            for (uint kx = 0; kx < FILTER_SIZE_X; ++kx) {
                // input position i satisfying o = i * stride + k
                const int ny = (int)oy - (int)ky - INPUT_OFFSET_Y;
                const int nx = (int)ox - (int)kx - INPUT_OFFSET_X;
                if (ny < 0 || nx < 0) continue;
                if (ny % STRIDE_Y != 0 || nx % STRIDE_X != 0) continue;
                const uint iy = ny / STRIDE_Y;
                const uint ix = nx / STRIDE_X;
                if (iy >= INPUT0_SIZE_Y || ix >= INPUT0_SIZE_X) continue;
                acc += input[INPUT0_GET_INDEX(b, in_feature_base + ifm, iy, ix)]
                     * weights[FILTER_GET_INDEX(ofm, ifm, ky, kx)];
            }
        }
    }
#if BIAS_TERM
    acc += bias[ofm];
#endif
    output[OUTPUT_GET_INDEX(b, out_feature, oy, ox)] = ACTIVATION(acc);
}
"#;

const ELTWISE_REF: &str = r#"
KERNEL_HEADER
#define INPUT1_GET_INDEX(b, f, y, x) (INPUT1_OFFSET + (b)*INPUT1_PITCH_BATCH + (f)*INPUT1_PITCH_FEATURE + (y)*INPUT1_PITCH_Y + (x)*INPUT1_PITCH_X)
__kernel void eltwise_ref(__global const UNIT_TYPE* input0,
                          __global const UNIT_TYPE* input1,
                          __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    UNIT_TYPE a = input0[INPUT0_GET_INDEX(b, f, y, x)];
    UNIT_TYPE c = input1[INPUT1_GET_INDEX(b, f, y, x)];
#if   ELTWISE_MODE_SUM
    UNIT_TYPE v = a + c;
#elif ELTWISE_MODE_SUB
    UNIT_TYPE v = a - c;
#elif ELTWISE_MODE_MAX
    UNIT_TYPE v = max(a, c);
#else
    UNIT_TYPE v = a * c;
#endif
    output[OUTPUT_GET_INDEX(b, f, y, x)] = ACTIVATION(v);
}
"#;

const FULLY_CONNECTED_REF: &str = r#"
KERNEL_HEADER
#define FILTER_GET_INDEX(o, i, y, x) (FILTER_OFFSET + (o)*FILTER_PITCH_OFM + (i)*FILTER_PITCH_IFM + (y)*FILTER_PITCH_Y + (x)*FILTER_PITCH_X)
__kernel void fully_connected_ref(__global const UNIT_TYPE* input,
                                  __global UNIT_TYPE* output,
                                  __global const UNIT_TYPE* weights
#if BIAS_TERM
                                , __global const UNIT_TYPE* bias
#endif
                                 )
{
    const uint ofm = get_global_id(0);
    const uint b = get_global_id(1);
    if (ofm >= FILTER_OFM_NUM) return;
    UNIT_TYPE acc = UNIT_VAL_ZERO;
    for (uint ifm = 0; ifm < INPUT0_FEATURE_NUM; ++ifm)
        for (uint y = 0; y < INPUT0_SIZE_Y; ++y)
            for (uint x = 0; x < INPUT0_SIZE_X; ++x)
                acc += input[INPUT0_GET_INDEX(b, ifm, y, x)]
                     * weights[FILTER_GET_INDEX(ofm, ifm, y, x)];
#if BIAS_TERM
    acc += bias[ofm];
#endif
    output[OUTPUT_GET_INDEX(b, ofm, 0, 0)] = ACTIVATION(acc);
}
"#;

const INDEX_SELECT_REF: &str = r#"
KERNEL_HEADER
__kernel void index_select_ref(__global const UNIT_TYPE* input,
                               __global const int* indices,
                               __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / OUTPUT_FEATURE_NUM;
    const uint f = bf % OUTPUT_FEATURE_NUM;
    if (x >= OUTPUT_SIZE_X) return;
    const uint gathered =
        AXIS_BATCH ? indices[b] : AXIS_FEATURE ? indices[f] : AXIS_Y ? indices[y] : indices[x];
    const uint sb = AXIS_BATCH ? gathered : b;
    const uint sf = AXIS_FEATURE ? gathered : f;
    const uint sy = AXIS_Y ? gathered : y;
    const uint sx = AXIS_X ? gathered : x;
    output[OUTPUT_GET_INDEX(b, f, y, x)] = input[INPUT0_GET_INDEX(sb, sf, sy, sx)];
}
"#;

const LOOKUP_TABLE_REF: &str = r#"
KERNEL_HEADER
// Gathers the values sitting at previously computed argmax indices.
__kernel void lookup_table_ref(__global const UNIT_TYPE* input,
                               __global const UNIT_TYPE* indices,
                               __global UNIT_TYPE* output)
{
    const uint i = get_global_id(0);
    if (i >= OUTPUT_ELEMENTS) return;
    const uint group = i / AXIS_OUT_SIZE;
    const uint idx = (uint)indices[i];
    output[i] = input[GROUP_ELEMENT(group, idx)];
}
"#;

const LRN_REF: &str = r#"
KERNEL_HEADER
__kernel void lrn_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    UNIT_TYPE sum = UNIT_VAL_ZERO;
#if ACROSS_CHANNEL
    const int lo = (int)f - LOCAL_SIZE / 2;
    for (int i = 0; i < LOCAL_SIZE; ++i) {
        const int cf = lo + i;
        if (cf < 0 || cf >= INPUT0_FEATURE_NUM) continue;
        UNIT_TYPE v = input[INPUT0_GET_INDEX(b, cf, y, x)];
        sum += v * v;
    }
#else
    const int ly = (int)y - LOCAL_SIZE / 2;
    const int lx = (int)x - LOCAL_SIZE / 2;
    for (int iy = 0; iy < LOCAL_SIZE; ++iy)
        for (int ix = 0; ix < LOCAL_SIZE; ++ix) {
            const int cy = ly + iy;
            const int cx = lx + ix;
            if (cy < 0 || cy >= INPUT0_SIZE_Y || cx < 0 || cx >= INPUT0_SIZE_X) continue;
            UNIT_TYPE v = input[INPUT0_GET_INDEX(b, f, cy, cx)];
            sum += v * v;
        }
#endif
    UNIT_TYPE v = input[INPUT0_GET_INDEX(b, f, y, x)];
    output[OUTPUT_GET_INDEX(b, f, y, x)] = v * pow(K + ALPHA * sum / LOCAL_ELEMENTS, -BETA);
}
"#;

const MEAN_SUBTRACT_REF: &str = r#"
KERNEL_HEADER
#define MEAN_GET_INDEX(b, f, y, x) (MEAN_OFFSET + (b)*MEAN_PITCH_BATCH + (f)*MEAN_PITCH_FEATURE + (y)*MEAN_PITCH_Y + (x)*MEAN_PITCH_X)
__kernel void mean_subtract_ref(__global const UNIT_TYPE* input,
                                __global const UNIT_TYPE* mean,
                                __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    output[OUTPUT_GET_INDEX(b, f, y, x)] =
        input[INPUT0_GET_INDEX(b, f, y, x)]
      - mean[MEAN_GET_INDEX(b % MEAN_BATCH_NUM, f % MEAN_FEATURE_NUM,
                            y % MEAN_SIZE_Y, x % MEAN_SIZE_X)];
}
"#;

const NORMALIZE_REF: &str = r#"
KERNEL_HEADER
// L2 normalisation with per-feature (or single) trained scale factors.
__kernel void normalize_ref(__global const UNIT_TYPE* input,
                            __global UNIT_TYPE* output,
                            __global const UNIT_TYPE* scale)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint b = get_global_id(2);
    if (x >= INPUT0_SIZE_X) return;
    UNIT_TYPE norm = UNIT_VAL_ZERO;
#if ACROSS_SPATIAL
    for (uint f = 0; f < INPUT0_FEATURE_NUM; ++f)
        for (uint iy = 0; iy < INPUT0_SIZE_Y; ++iy)
            for (uint ix = 0; ix < INPUT0_SIZE_X; ++ix) {
                UNIT_TYPE v = input[INPUT0_GET_INDEX(b, f, iy, ix)];
                norm += v * v;
            }
#else
    for (uint f = 0; f < INPUT0_FEATURE_NUM; ++f) {
        UNIT_TYPE v = input[INPUT0_GET_INDEX(b, f, y, x)];
        norm += v * v;
    }
#endif
    norm = rsqrt(norm + EPSILON);
    for (uint f = 0; f < INPUT0_FEATURE_NUM; ++f)
        output[OUTPUT_GET_INDEX(b, f, y, x)] =
            input[INPUT0_GET_INDEX(b, f, y, x)] * norm
          * scale[SCALE_PER_FEATURE ? f : 0];
}
"#;

const PERMUTE_REF: &str = r#"
KERNEL_HEADER
__kernel void permute_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    const uint src[4] = { b, f, y, x };
    output[OUTPUT_GET_INDEX(src[PERMUTE_ORDER_0], src[PERMUTE_ORDER_1],
                            src[PERMUTE_ORDER_2], src[PERMUTE_ORDER_3])] =
        input[INPUT0_GET_INDEX(b, f, y, x)];
}
"#;

const POOLING_REF: &str = r#"
KERNEL_HEADER
__kernel void pooling_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint ox = get_global_id(0);
    const uint oy = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (ox >= OUTPUT_SIZE_X) return;
#if POOL_MAX
    UNIT_TYPE acc = -UNIT_VAL_MAX;
#else
    UNIT_TYPE acc = UNIT_VAL_ZERO;
    uint seen = 0;
#endif
    for (uint ky = 0; ky < POOL_SIZE_Y; ++ky)
        for (uint kx = 0; kx < POOL_SIZE_X; ++kx) {
            const int iy = (int)(oy * STRIDE_Y + ky) + INPUT_OFFSET_Y;
            const int ix = (int)(ox * STRIDE_X + kx) + INPUT_OFFSET_X;
            if (iy < 0 || iy >= INPUT0_SIZE_Y || ix < 0 || ix >= INPUT0_SIZE_X) continue;
            UNIT_TYPE v = input[INPUT0_GET_INDEX(b, f, iy, ix)];
#if POOL_MAX
            acc = max(acc, v);
#else
            acc += v;
            ++seen;
#endif
        }
#if POOL_MAX
    output[OUTPUT_GET_INDEX(b, f, oy, ox)] = acc;
#else
    output[OUTPUT_GET_INDEX(b, f, oy, ox)] = seen ? acc / (UNIT_TYPE)seen : UNIT_VAL_ZERO;
#endif
}
"#;

const REGION_YOLO_REF: &str = r#"
KERNEL_HEADER
// Applies logistic activation to box geometry/objectness and, optionally,
// softmax over the class scores of every anchor.
__kernel void region_yolo_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint ba = get_global_id(2);
    const uint b = ba / ANCHOR_NUM;
    const uint anchor = ba % ANCHOR_NUM;
    if (x >= INPUT0_SIZE_X) return;
    const uint stride = COORDS + CLASSES + 1;
    for (uint c = 0; c < stride; ++c) {
        const uint f = anchor * stride + c;
        UNIT_TYPE v = input[INPUT0_GET_INDEX(b, f, y, x)];
        if (c < 2 || c == COORDS)
            v = UNIT_VAL_ONE / (UNIT_VAL_ONE + exp(-v));
        output[OUTPUT_GET_INDEX(b, f, y, x)] = v;
    }
#if DO_SOFTMAX
    UNIT_TYPE max_val = -UNIT_VAL_MAX;
    for (uint c = 0; c < CLASSES; ++c)
        max_val = max(max_val, output[OUTPUT_GET_INDEX(b, anchor * stride + COORDS + 1 + c, y, x)]);
    UNIT_TYPE denom = UNIT_VAL_ZERO;
    for (uint c = 0; c < CLASSES; ++c) {
        const uint f = anchor * stride + COORDS + 1 + c;
        UNIT_TYPE e = exp(output[OUTPUT_GET_INDEX(b, f, y, x)] - max_val);
        output[OUTPUT_GET_INDEX(b, f, y, x)] = e;
        denom += e;
    }
    for (uint c = 0; c < CLASSES; ++c)
        output[OUTPUT_GET_INDEX(b, anchor * stride + COORDS + 1 + c, y, x)] /= denom;
#endif
}
"#;

const REORDER_REF: &str = r#"
KERNEL_HEADER
#define MEAN_GET_INDEX(b, f, y, x) (MEAN_OFFSET + (b)*MEAN_PITCH_BATCH + (f)*MEAN_PITCH_FEATURE + (y)*MEAN_PITCH_Y + (x)*MEAN_PITCH_X)
__kernel void reorder_ref(__global const INPUT0_TYPE* input,
                          __global OUTPUT_TYPE* output
#if SUBTRACT_MEAN_MEMORY
                        , __global const INPUT0_TYPE* mean
#endif
                         )
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    float v = (float)input[INPUT0_GET_INDEX(b, f, y, x)];
#if SUBTRACT_PER_FEATURE
    v -= SUBTRACT_VALUE(f);
#elif SUBTRACT_MEAN_MEMORY
    v -= (float)mean[MEAN_GET_INDEX(0, f % MEAN_FEATURE_NUM, y % MEAN_SIZE_Y, x % MEAN_SIZE_X)];
#endif
    output[OUTPUT_GET_INDEX(b, f, y, x)] = (OUTPUT_TYPE)v;
}
"#;

const ROI_POOLING_REF: &str = r#"
KERNEL_HEADER
// rois: one (batch, x0, y0, x1, y1) record per output batch entry.
__kernel void roi_pooling_ref(__global const UNIT_TYPE* input,
                              __global const UNIT_TYPE* rois,
                              __global UNIT_TYPE* output)
{
    const uint px = get_global_id(0);
    const uint py = get_global_id(1);
    const uint rf = get_global_id(2);
    const uint roi = rf / OUTPUT_FEATURE_NUM;
    const uint f = rf % OUTPUT_FEATURE_NUM;
    if (px >= OUTPUT_SIZE_X) return;

    const uint rb = (uint)rois[roi * 5 + 0];
    const int x0 = (int)round(rois[roi * 5 + 1] * SPATIAL_SCALE);
    const int y0 = (int)round(rois[roi * 5 + 2] * SPATIAL_SCALE);
    const int x1 = (int)round(rois[roi * 5 + 3] * SPATIAL_SCALE);
    const int y1 = (int)round(rois[roi * 5 + 4] * SPATIAL_SCALE);
    const int roi_w = max(x1 - x0 + 1, 1);
    const int roi_h = max(y1 - y0 + 1, 1);

    const int hstart = y0 + (py * roi_h) / POOLED_HEIGHT;
    const int hend = y0 + ((py + 1) * roi_h + POOLED_HEIGHT - 1) / POOLED_HEIGHT;
    const int wstart = x0 + (px * roi_w) / POOLED_WIDTH;
    const int wend = x0 + ((px + 1) * roi_w + POOLED_WIDTH - 1) / POOLED_WIDTH;

    UNIT_TYPE acc = -UNIT_VAL_MAX;
    for (int iy = max(hstart, 0); iy < min(hend, (int)INPUT0_SIZE_Y); ++iy)
        for (int ix = max(wstart, 0); ix < min(wend, (int)INPUT0_SIZE_X); ++ix)
            acc = max(acc, input[INPUT0_GET_INDEX(rb, f, iy, ix)]);
    output[OUTPUT_GET_INDEX(roi, f, py, px)] = acc == -UNIT_VAL_MAX ? UNIT_VAL_ZERO : acc;
}
"#;

const SCALE_REF: &str = r#"
KERNEL_HEADER
#define SCALE_GET_INDEX(b, f, y, x) (SCALE_OFFSET + (b)*SCALE_PITCH_BATCH + (f)*SCALE_PITCH_FEATURE + (y)*SCALE_PITCH_Y + (x)*SCALE_PITCH_X)
__kernel void scale_ref(__global const UNIT_TYPE* input,
                        __global const UNIT_TYPE* scale,
                        __global UNIT_TYPE* output
#if BIAS_TERM
                      , __global const UNIT_TYPE* bias
#endif
                       )
{
    const uint x = get_global_id(0);
    const uint y = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (x >= INPUT0_SIZE_X) return;
    const uint si = SCALE_GET_INDEX(b % SCALE_BATCH_NUM, f % SCALE_FEATURE_NUM,
                                    y % SCALE_SIZE_Y, x % SCALE_SIZE_X);
    UNIT_TYPE v = input[INPUT0_GET_INDEX(b, f, y, x)] * scale[si];
#if BIAS_TERM
    v += bias[si];
#endif
    output[OUTPUT_GET_INDEX(b, f, y, x)] = v;
}
"#;

const SIMPLER_NMS_REF: &str = r#"
KERNEL_HEADER
#define INPUT1_GET_INDEX(b, f, y, x) (INPUT1_OFFSET + (b)*INPUT1_PITCH_BATCH + (f)*INPUT1_PITCH_FEATURE + (y)*INPUT1_PITCH_Y + (x)*INPUT1_PITCH_X)
#define ANCHOR_NUM (SCALES_NUM * RATIOS_NUM)
#define PROPOSAL_NUM (INPUT0_SIZE_Y * INPUT0_SIZE_X * ANCHOR_NUM)
// Single work item: proposals are regenerated per scan, greedy suppression
// picks one survivor per pass. Memory-free at the cost of rescanning.
static float4 decode_proposal(uint idx,
                              __global const UNIT_TYPE* cls_scores,
                              __global const UNIT_TYPE* bbox_pred,
                              float img_w, float img_h, float* score)
{
    __constant float scales[SCALES_NUM] = SCALES_INIT;
    __constant float ratios[RATIOS_NUM] = RATIOS_INIT;
    const uint a = idx % ANCHOR_NUM;
    const uint x = (idx / ANCHOR_NUM) % INPUT0_SIZE_X;
    const uint y = idx / (ANCHOR_NUM * INPUT0_SIZE_X);
    const float ratio = ratios[a / SCALES_NUM];
    const float scale = scales[a % SCALES_NUM];
    const float w = FEATURE_STRIDE * scale * sqrt(1.0f / ratio);
    const float h = FEATURE_STRIDE * scale * sqrt(ratio);
    const float cx0 = x * (float)FEATURE_STRIDE + FEATURE_STRIDE / 2.0f;
    const float cy0 = y * (float)FEATURE_STRIDE + FEATURE_STRIDE / 2.0f;
    *score = cls_scores[INPUT0_GET_INDEX(0, ANCHOR_NUM + a, y, x)];
    const float dx = bbox_pred[INPUT1_GET_INDEX(0, a * 4 + 0, y, x)];
    const float dy = bbox_pred[INPUT1_GET_INDEX(0, a * 4 + 1, y, x)];
    const float dw = bbox_pred[INPUT1_GET_INDEX(0, a * 4 + 2, y, x)];
    const float dh = bbox_pred[INPUT1_GET_INDEX(0, a * 4 + 3, y, x)];
    const float pcx = cx0 + dx * w;
    const float pcy = cy0 + dy * h;
    const float pw = w * exp(dw);
    const float ph = h * exp(dh);
    return (float4)(clamp(pcx - pw / 2.0f, 0.0f, img_w - 1.0f),
                    clamp(pcy - ph / 2.0f, 0.0f, img_h - 1.0f),
                    clamp(pcx + pw / 2.0f, 0.0f, img_w - 1.0f),
                    clamp(pcy + ph / 2.0f, 0.0f, img_h - 1.0f));
}

static float box_iou(float4 a, float4 b)
{
    const float ix = max(min(a.z, b.z) - max(a.x, b.x) + 1.0f, 0.0f);
    const float iy = max(min(a.w, b.w) - max(a.y, b.y) + 1.0f, 0.0f);
    const float inter = ix * iy;
    const float area_a = (a.z - a.x + 1.0f) * (a.w - a.y + 1.0f);
    const float area_b = (b.z - b.x + 1.0f) * (b.w - b.y + 1.0f);
    return inter / (area_a + area_b - inter);
}

__kernel void simpler_nms_ref(__global const UNIT_TYPE* cls_scores,
                              __global const UNIT_TYPE* bbox_pred,
                              __global const UNIT_TYPE* image_info,
                              __global UNIT_TYPE* output)
{
    const float img_h = image_info[0];
    const float img_w = image_info[1];
    float4 kept[POST_NMS_TOPN];
    uint kept_num = 0;
    float last_score = INFINITY;
    uint last_idx = PROPOSAL_NUM;

    while (kept_num < POST_NMS_TOPN) {
        float best_score = -INFINITY;
        uint best_idx = PROPOSAL_NUM;
        float4 best_box;
        for (uint idx = 0; idx < PROPOSAL_NUM; ++idx) {
            float score;
            float4 box = decode_proposal(idx, cls_scores, bbox_pred, img_w, img_h, &score);
            if (score > last_score || (score == last_score && idx <= last_idx)) continue;
            if (box.z - box.x + 1.0f < MIN_BOX_SIZE || box.w - box.y + 1.0f < MIN_BOX_SIZE)
                continue;
            if (score > best_score) {
                best_score = score;
                best_idx = idx;
                best_box = box;
            }
        }
        if (best_idx == PROPOSAL_NUM) break;
        last_score = best_score;
        last_idx = best_idx;

        bool suppressed = false;
        for (uint k = 0; k < kept_num; ++k)
            suppressed |= box_iou(kept[k], best_box) > IOU_THRESHOLD;
        if (suppressed) continue;

        kept[kept_num] = best_box;
        output[OUTPUT_GET_INDEX(kept_num, 0, 0, 0)] = UNIT_VAL_ZERO;
        output[OUTPUT_GET_INDEX(kept_num, 0, 0, 1)] = best_box.x;
        output[OUTPUT_GET_INDEX(kept_num, 0, 0, 2)] = best_box.y;
        output[OUTPUT_GET_INDEX(kept_num, 0, 0, 3)] = best_box.z;
        output[OUTPUT_GET_INDEX(kept_num, 0, 0, 4)] = best_box.w;
        ++kept_num;
    }
}
"#;

const SOFTMAX_REF: &str = r#"
KERNEL_HEADER
// One work item per normalisation group: out = exp(in - max) / sum.
__kernel void softmax_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint group = get_global_id(0);
    if (group >= GROUP_NUM) return;
    UNIT_TYPE max_val = -UNIT_VAL_MAX;
    for (uint i = 0; i < GROUP_SIZE; ++i)
        max_val = max(max_val, input[GROUP_ELEMENT(group, i)]);
    UNIT_TYPE denom = UNIT_VAL_ZERO;
    for (uint i = 0; i < GROUP_SIZE; ++i)
        denom += exp(input[GROUP_ELEMENT(group, i)] - max_val);
    for (uint i = 0; i < GROUP_SIZE; ++i)
        output[OUTPUT_GROUP_ELEMENT(group, i)] =
            exp(input[GROUP_ELEMENT(group, i)] - max_val) / denom;
}
"#;

const SOFTMAX_ITEMS_CLASS: &str = r#"
KERNEL_HEADER
// Optimised single-group variant: a work group reduces max and sum in
// local memory, then streams the normalised values.
__kernel void softmax_items_class_optimized(__global const UNIT_TYPE* input,
                                            __global UNIT_TYPE* output)
{
    const uint lid = get_local_id(0);
    const uint lsz = get_local_size(0);
    const uint group = get_group_id(0);
    __local UNIT_TYPE scratch[LWS_SIZE];

    UNIT_TYPE max_val = -UNIT_VAL_MAX;
    for (uint i = lid; i < GROUP_SIZE; i += lsz)
        max_val = max(max_val, input[GROUP_ELEMENT(group, i)]);
    scratch[lid] = max_val;
    barrier(CLK_LOCAL_MEM_FENCE);
    for (uint s = lsz / 2; s > 0; s >>= 1) {
        if (lid < s) scratch[lid] = max(scratch[lid], scratch[lid + s]);
        barrier(CLK_LOCAL_MEM_FENCE);
    }
    max_val = scratch[0];
    barrier(CLK_LOCAL_MEM_FENCE);

    UNIT_TYPE sum = UNIT_VAL_ZERO;
    for (uint i = lid; i < GROUP_SIZE; i += lsz)
        sum += exp(input[GROUP_ELEMENT(group, i)] - max_val);
    scratch[lid] = sum;
    barrier(CLK_LOCAL_MEM_FENCE);
    for (uint s = lsz / 2; s > 0; s >>= 1) {
        if (lid < s) scratch[lid] += scratch[lid + s];
        barrier(CLK_LOCAL_MEM_FENCE);
    }
    sum = scratch[0];

    for (uint i = lid; i < GROUP_SIZE; i += lsz)
        output[OUTPUT_GROUP_ELEMENT(group, i)] =
            exp(input[GROUP_ELEMENT(group, i)] - max_val) / sum;
}
"#;

const UPSAMPLING_REF: &str = r#"
KERNEL_HEADER
__kernel void upsampling_ref(__global const UNIT_TYPE* input, __global UNIT_TYPE* output)
{
    const uint ox = get_global_id(0);
    const uint oy = get_global_id(1);
    const uint bf = get_global_id(2);
    const uint b = bf / INPUT0_FEATURE_NUM;
    const uint f = bf % INPUT0_FEATURE_NUM;
    if (ox >= OUTPUT_SIZE_X) return;
#if BILINEAR
    const float fy = ((float)oy + 0.5f) / (float)SCALE - 0.5f;
    const float fx = ((float)ox + 0.5f) / (float)SCALE - 0.5f;
    const int y0 = max((int)floor(fy), 0);
    const int x0 = max((int)floor(fx), 0);
    const int y1 = min(y0 + 1, (int)INPUT0_SIZE_Y - 1);
    const int x1 = min(x0 + 1, (int)INPUT0_SIZE_X - 1);
    const float wy = fy - floor(fy);
    const float wx = fx - floor(fx);
    const float v =
        (1.0f - wy) * ((1.0f - wx) * input[INPUT0_GET_INDEX(b, f, y0, x0)]
                     + wx * input[INPUT0_GET_INDEX(b, f, y0, x1)])
        + wy * ((1.0f - wx) * input[INPUT0_GET_INDEX(b, f, y1, x0)]
              + wx * input[INPUT0_GET_INDEX(b, f, y1, x1)]);
    output[OUTPUT_GET_INDEX(b, f, oy, ox)] = (UNIT_TYPE)v;
#else
    output[OUTPUT_GET_INDEX(b, f, oy, ox)] =
        input[INPUT0_GET_INDEX(b, f, oy / SCALE, ox / SCALE)];
#endif
}
"#;

/// Prepends the shared helper block; the engine injects it once per
/// compiled program, after the jit constants.
pub fn with_header(template: &'static str) -> String {
    template.replace("KERNEL_HEADER", ACTIVATION_HELPER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_resolves() {
        for name in names() {
            assert!(get(name).is_ok());
        }
        assert!(get("no_such_kernel").is_err());
    }

    #[test]
    fn templates_declare_their_entry_point() {
        for (name, src) in TEMPLATES {
            assert!(
                src.contains(&format!("__kernel void {name}")),
                "template {name} entry point mismatch"
            );
        }
    }
}
