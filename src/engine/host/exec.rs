//! Native execution of kernel templates. Every executor reads geometry
//! exclusively from the jit constants, exactly as the device template
//! would, so layout handling (pitches, padding, offsets) is exercised the
//! same way on both paths.

use crate::engine::device::RuntimeArg;
use crate::engine::host::HostKernel;
use crate::errors::{OxError, OxResult};
use crate::kernels::arg_max_min::reduction_axes;
use crate::kernels::softmax::dim_axes;
use crate::kernels::JitConstants;
use crate::memory::Memory;
use crate::tensor::Axis;
use crate::topology::SoftmaxDim;

pub(crate) fn run(kernel: &HostKernel, args: &[RuntimeArg]) -> OxResult<()> {
    let jit = &kernel.jit;
    match kernel.template {
        "activation_ref" => activation(jit, args),
        "arg_max_min_ref" => arg_max_min(jit, args),
        "batch_norm_ref" => batch_norm(jit, args),
        "concatenation_ref" => concatenation(jit, args),
        "convolution_ref" | "convolution_bfyx_os_iyx_osv16" | "convolution_yxfb_oiyx_b8" => {
            convolution(jit, args)
        }
        "crop_ref" => crop(jit, args),
        "deconvolution_ref" => deconvolution(jit, args),
        "eltwise_ref" => eltwise(jit, args),
        "fully_connected_ref" => fully_connected(jit, args),
        "index_select_ref" => index_select(jit, args),
        "lookup_table_ref" => lookup_table(jit, args),
        "lrn_ref" => lrn(jit, args),
        "mean_subtract_ref" => mean_subtract(jit, args),
        "normalize_ref" => normalize(jit, args),
        "permute_ref" => permute(jit, args),
        "pooling_ref" => pooling(jit, args),
        "region_yolo_ref" => region_yolo(jit, args),
        "reorder_ref" => reorder(jit, args),
        "roi_pooling_ref" => roi_pooling(jit, args),
        "scale_ref" => scale(jit, args),
        "simpler_nms_ref" => simpler_nms(jit, args),
        "softmax_ref" | "softmax_items_class_optimized" => softmax(jit, args),
        "upsampling_ref" => upsampling(jit, args),
        other => Err(OxError::NotImplemented(format!(
            "template '{other}' has no reference executor"
        ))),
    }
}

// ---- argument and geometry helpers ----

fn mem<'a>(args: &'a [RuntimeArg], i: usize) -> OxResult<&'a Memory> {
    match args.get(i) {
        Some(RuntimeArg::Memory(m)) => Ok(m),
        _ => Err(OxError::DeviceError(format!("argument {i} is not a memory object"))),
    }
}

fn scalar(args: &[RuntimeArg], i: usize) -> OxResult<f64> {
    match args.get(i) {
        Some(RuntimeArg::Scalar(s)) => Ok(s.as_f64()),
        _ => Err(OxError::DeviceError(format!("argument {i} is not a scalar"))),
    }
}

/// Geometry of one data tensor parsed back from its jit prefix.
#[derive(Debug, Clone, Copy)]
struct Geom {
    b: usize,
    f: usize,
    y: usize,
    x: usize,
    pb: usize,
    pf: usize,
    py: usize,
    px: usize,
    off: usize,
}

impl Geom {
    fn parse(jit: &JitConstants, prefix: &str) -> OxResult<Geom> {
        let i = |suffix: &str| jit.int(&format!("{prefix}_{suffix}")).map(|v| v as usize);
        Ok(Geom {
            b: i("BATCH_NUM")?,
            f: i("FEATURE_NUM")?,
            y: i("SIZE_Y")?,
            x: i("SIZE_X")?,
            pb: i("PITCH_BATCH")?,
            pf: i("PITCH_FEATURE")?,
            py: i("PITCH_Y")?,
            px: i("PITCH_X")?,
            off: i("OFFSET")?,
        })
    }

    fn at(&self, b: usize, f: usize, y: usize, x: usize) -> usize {
        self.off + b * self.pb + f * self.pf + y * self.py + x * self.px
    }

    fn size(&self, axis: Axis) -> usize {
        match axis {
            Axis::Batch => self.b,
            Axis::Feature => self.f,
            Axis::Y => self.y,
            Axis::X => self.x,
        }
    }
}

/// Weights geometry; blocked layouts dispatch on their jitted tag.
#[derive(Debug, Clone, Copy)]
struct FilterGeom {
    ofm: usize,
    ifm: usize,
    y: usize,
    x: usize,
    po: usize,
    pi: usize,
    py: usize,
    px: usize,
    off: usize,
    blocked_osv16: bool,
}

impl FilterGeom {
    fn parse(jit: &JitConstants) -> OxResult<FilterGeom> {
        let i = |suffix: &str| jit.int(&format!("FILTER_{suffix}")).map(|v| v as usize);
        Ok(FilterGeom {
            ofm: i("OFM_NUM")?,
            ifm: i("IFM_NUM")?,
            y: i("SIZE_Y")?,
            x: i("SIZE_X")?,
            po: i("PITCH_OFM")?,
            pi: i("PITCH_IFM")?,
            py: i("PITCH_Y")?,
            px: i("PITCH_X")?,
            off: i("OFFSET")?,
            blocked_osv16: jit.is_defined("FILTER_LAYOUT_OS_IYX_OSV16"),
        })
    }

    fn at(&self, o: usize, i: usize, y: usize, x: usize) -> usize {
        if self.blocked_osv16 {
            ((o / 16) * self.ifm * self.y * self.x + i * self.y * self.x + y * self.x + x) * 16
                + o % 16
        } else {
            self.off + o * self.po + i * self.pi + y * self.py + x * self.px
        }
    }
}

/// Fused activation parsed from the jit flags.
fn activation_of(jit: &JitConstants) -> OxResult<impl Fn(f64) -> f64> {
    let fused = jit.int_or("FUSED_ACTIVATION", 0) != 0;
    let relu = jit.is_defined("ACTIVATION_RELU");
    let sigmoid = jit.is_defined("ACTIVATION_SIGMOID");
    let slope = if relu { jit.float("NEGATIVE_SLOPE")? as f64 } else { 0.0 };
    Ok(move |v: f64| {
        if !fused {
            v
        } else if relu {
            if v > 0.0 {
                v
            } else {
                v * slope
            }
        } else if sigmoid {
            1.0 / (1.0 + (-v).exp())
        } else {
            v.tanh()
        }
    })
}

/// Index decomposition, outermost axis first.
fn unflatten(mut idx: usize, sizes: &[usize]) -> Vec<usize> {
    let mut out = vec![0; sizes.len()];
    for k in (0..sizes.len()).rev() {
        let s = sizes[k].max(1);
        out[k] = idx % s;
        idx /= s;
    }
    out
}

fn coords(axes: &[Axis], values: &[usize]) -> [usize; 4] {
    let mut c = [0usize; 4];
    for (axis, v) in axes.iter().zip(values) {
        match axis {
            Axis::Batch => c[0] = *v,
            Axis::Feature => c[1] = *v,
            Axis::Y => c[2] = *v,
            Axis::X => c[3] = *v,
        }
    }
    c
}

fn merge_coords(a: [usize; 4], b: [usize; 4]) -> [usize; 4] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]]
}

fn axis_sizes(g: &Geom, axes: &[Axis]) -> Vec<usize> {
    axes.iter().map(|a| g.size(*a)).collect()
}

#[cfg(feature = "rayon")]
fn compute_all(total: usize, f: impl Fn(usize) -> f64 + Send + Sync) -> Vec<f64> {
    use rayon::prelude::*;
    (0..total).into_par_iter().map(f).collect()
}

#[cfg(not(feature = "rayon"))]
fn compute_all(total: usize, f: impl Fn(usize) -> f64 + Send + Sync) -> Vec<f64> {
    (0..total).map(f).collect()
}

/// Plain-vector snapshot of a buffer; the hot loops sweep these so the
/// parallel path never carries lock guards across threads.
fn snapshot(m: &Memory) -> Vec<f64> {
    let view = m.scalars();
    (0..m.layout().physical_size()).map(|i| view.get(i)).collect()
}

// ---- executors ----

fn for_each_logical(g: &Geom, mut body: impl FnMut(usize, usize, usize, usize)) {
    for b in 0..g.b {
        for f in 0..g.f {
            for y in 0..g.y {
                for x in 0..g.x {
                    body(b, f, y, x);
                }
            }
        }
    }
}

fn activation(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let act = activation_of(jit)?;
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    for_each_logical(&input, |b, f, y, x| {
        dst.set(output.at(b, f, y, x), act(src.get(input.at(b, f, y, x))));
    });
    Ok(())
}

fn eltwise(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let in0 = Geom::parse(jit, "INPUT0")?;
    let in1 = Geom::parse(jit, "INPUT1")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let act = activation_of(jit)?;
    let a = mem(args, 0)?.scalars();
    let c = mem(args, 1)?.scalars();
    let mut dst = mem(args, 2)?.scalars_mut();
    let sum = jit.is_defined("ELTWISE_MODE_SUM");
    let sub = jit.is_defined("ELTWISE_MODE_SUB");
    let maxm = jit.is_defined("ELTWISE_MODE_MAX");
    for_each_logical(&in0, |b, f, y, x| {
        let va = a.get(in0.at(b, f, y, x));
        let vb = c.get(in1.at(b, f, y, x));
        let v = if sum {
            va + vb
        } else if sub {
            va - vb
        } else if maxm {
            va.max(vb)
        } else {
            va * vb
        };
        dst.set(output.at(b, f, y, x), act(v));
    });
    Ok(())
}

fn scale(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let sc = Geom::parse(jit, "SCALE")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let bias_term = jit.int_or("BIAS_TERM", 0) != 0;
    let src = mem(args, 0)?.scalars();
    let scales = mem(args, 1)?.scalars();
    let mut dst = mem(args, 2)?.scalars_mut();
    let bias = if bias_term { Some(mem(args, 3)?.scalars()) } else { None };
    for_each_logical(&input, |b, f, y, x| {
        let si = sc.at(b % sc.b, f % sc.f, y % sc.y, x % sc.x);
        let mut v = src.get(input.at(b, f, y, x)) * scales.get(si);
        if let Some(bias) = &bias {
            v += bias.get(si);
        }
        dst.set(output.at(b, f, y, x), v);
    });
    Ok(())
}

fn mean_subtract(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let mean = Geom::parse(jit, "MEAN")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let src = mem(args, 0)?.scalars();
    let means = mem(args, 1)?.scalars();
    let mut dst = mem(args, 2)?.scalars_mut();
    for_each_logical(&input, |b, f, y, x| {
        let m = means.get(mean.at(b % mean.b, f % mean.f, y % mean.y, x % mean.x));
        dst.set(output.at(b, f, y, x), src.get(input.at(b, f, y, x)) - m);
    });
    Ok(())
}

fn batch_norm(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let epsilon = jit.float("EPSILON")? as f64;
    let src = mem(args, 0)?.scalars();
    let means = mem(args, 1)?.scalars();
    let vars = mem(args, 2)?.scalars();
    let mut dst = mem(args, 3)?.scalars_mut();
    for_each_logical(&input, |b, f, y, x| {
        let v = src.get(input.at(b, f, y, x));
        let norm = (v - means.get(f)) / (vars.get(f) + epsilon).sqrt();
        dst.set(output.at(b, f, y, x), norm);
    });
    Ok(())
}

fn crop(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let ob = jit.int("CROP_OFFSET_BATCH")? as usize;
    let of = jit.int("CROP_OFFSET_FEATURE")? as usize;
    let oy = jit.int("CROP_OFFSET_Y")? as usize;
    let ox = jit.int("CROP_OFFSET_X")? as usize;
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    for_each_logical(&output, |b, f, y, x| {
        dst.set(output.at(b, f, y, x), src.get(input.at(b + ob, f + of, y + oy, x + ox)));
    });
    Ok(())
}

fn concatenation(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let offset = jit.int("CONCAT_OFFSET")? as usize;
    let axis = if jit.int_or("CONCAT_AXIS_BATCH", 0) != 0 {
        Axis::Batch
    } else if jit.int_or("CONCAT_AXIS_FEATURE", 0) != 0 {
        Axis::Feature
    } else if jit.int_or("CONCAT_AXIS_Y", 0) != 0 {
        Axis::Y
    } else {
        Axis::X
    };
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    for_each_logical(&input, |b, f, y, x| {
        let mut c = [b, f, y, x];
        match axis {
            Axis::Batch => c[0] += offset,
            Axis::Feature => c[1] += offset,
            Axis::Y => c[2] += offset,
            Axis::X => c[3] += offset,
        }
        dst.set(output.at(c[0], c[1], c[2], c[3]), src.get(input.at(b, f, y, x)));
    });
    Ok(())
}

fn convolution(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let filter = FilterGeom::parse(jit)?;
    let act = activation_of(jit)?;
    let stride_y = jit.int("STRIDE_Y")?;
    let stride_x = jit.int("STRIDE_X")?;
    let dil_y = jit.int("DILATION_Y")?;
    let dil_x = jit.int("DILATION_X")?;
    let off_y = jit.int("INPUT_OFFSET_Y")?;
    let off_x = jit.int("INPUT_OFFSET_X")?;
    let bias_term = jit.int_or("BIAS_TERM", 0) != 0;

    let src = snapshot(mem(args, 0)?);
    let weights = snapshot(mem(args, 2)?);
    let bias = if bias_term { Some(snapshot(mem(args, 3)?)) } else { None };
    let split_idx = scalar(args, args.len() - 1)? as usize;

    let out_y = output.y;
    let out_x = output.x;
    let total = input.b * filter.ofm * out_y * out_x;
    let values = compute_all(total, |idx| {
        let ox = idx % out_x;
        let oy = (idx / out_x) % out_y;
        let ofm = (idx / (out_x * out_y)) % filter.ofm;
        let b = idx / (out_x * out_y * filter.ofm);
        let mut acc = 0.0f64;
        for ifm in 0..filter.ifm {
            for ky in 0..filter.y {
                for kx in 0..filter.x {
                    let iy = (oy as i64) * stride_y + (ky as i64) * dil_y + off_y;
                    let ix = (ox as i64) * stride_x + (kx as i64) * dil_x + off_x;
                    if iy < 0 || iy >= input.y as i64 || ix < 0 || ix >= input.x as i64 {
                        continue;
                    }
                    let in_f = split_idx * filter.ifm + ifm;
                    acc += src[input.at(b, in_f, iy as usize, ix as usize)]
                        * weights[filter.at(ofm, ifm, ky, kx)];
                }
            }
        }
        if let Some(bias) = &bias {
            acc += bias[ofm];
        }
        act(acc)
    });

    let mut dst = mem(args, 1)?.scalars_mut();
    for (idx, v) in values.into_iter().enumerate() {
        let ox = idx % out_x;
        let oy = (idx / out_x) % out_y;
        let ofm = (idx / (out_x * out_y)) % filter.ofm;
        let b = idx / (out_x * out_y * filter.ofm);
        dst.set(output.at(b, split_idx * filter.ofm + ofm, oy, ox), v);
    }
    Ok(())
}

fn deconvolution(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let filter = FilterGeom::parse(jit)?;
    let act = activation_of(jit)?;
    let stride_y = jit.int("STRIDE_Y")? as usize;
    let stride_x = jit.int("STRIDE_X")? as usize;
    let off_y = jit.int("INPUT_OFFSET_Y")?;
    let off_x = jit.int("INPUT_OFFSET_X")?;
    let bias_term = jit.int_or("BIAS_TERM", 0) != 0;

    let src = mem(args, 0)?.scalars();
    let weights = mem(args, 2)?.scalars();
    let bias = if bias_term { Some(mem(args, 3)?.scalars()) } else { None };
    let split_idx = scalar(args, args.len() - 1)? as usize;
    let mut dst = mem(args, 1)?.scalars_mut();

    for b in 0..input.b {
        for ofm in 0..filter.ofm {
            for oy in 0..output.y {
                for ox in 0..output.x {
                    let mut acc = 0.0f64;
                    for ifm in 0..filter.ifm {
                        for ky in 0..filter.y {
                            for kx in 0..filter.x {
                                // input position i satisfying o = i * stride + k
                                let ny = oy as i64 - ky as i64 - off_y;
                                let nx = ox as i64 - kx as i64 - off_x;
                                if ny < 0 || nx < 0 {
                                    continue;
                                }
                                if ny % stride_y as i64 != 0 || nx % stride_x as i64 != 0 {
                                    continue;
                                }
                                let iy = (ny / stride_y as i64) as usize;
                                let ix = (nx / stride_x as i64) as usize;
                                if iy >= input.y || ix >= input.x {
                                    continue;
                                }
                                let in_f = split_idx * filter.ifm + ifm;
                                acc += src.get(input.at(b, in_f, iy, ix))
                                    * weights.get(filter.at(ofm, ifm, ky, kx));
                            }
                        }
                    }
                    if let Some(bias) = &bias {
                        acc += bias.get(ofm);
                    }
                    dst.set(output.at(b, split_idx * filter.ofm + ofm, oy, ox), act(acc));
                }
            }
        }
    }
    Ok(())
}

fn fully_connected(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let filter = FilterGeom::parse(jit)?;
    let act = activation_of(jit)?;
    let bias_term = jit.int_or("BIAS_TERM", 0) != 0;
    let src = snapshot(mem(args, 0)?);
    let weights = snapshot(mem(args, 2)?);
    let bias = if bias_term { Some(snapshot(mem(args, 3)?)) } else { None };

    let total = input.b * filter.ofm;
    let values = compute_all(total, |idx| {
        let ofm = idx % filter.ofm;
        let b = idx / filter.ofm;
        let mut acc = 0.0f64;
        for ifm in 0..input.f {
            for y in 0..input.y {
                for x in 0..input.x {
                    acc += src[input.at(b, ifm, y, x)] * weights[filter.at(ofm, ifm, y, x)];
                }
            }
        }
        if let Some(bias) = &bias {
            acc += bias[ofm];
        }
        act(acc)
    });

    let mut dst = mem(args, 1)?.scalars_mut();
    for (idx, v) in values.into_iter().enumerate() {
        let ofm = idx % filter.ofm;
        let b = idx / filter.ofm;
        dst.set(output.at(b, ofm, 0, 0), v);
    }
    Ok(())
}

fn pooling(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let is_max = jit.int("POOL_MAX")? != 0;
    let size_y = jit.int("POOL_SIZE_Y")? as usize;
    let size_x = jit.int("POOL_SIZE_X")? as usize;
    let stride_y = jit.int("STRIDE_Y")? as usize;
    let stride_x = jit.int("STRIDE_X")? as usize;
    let off_y = jit.int("INPUT_OFFSET_Y")?;
    let off_x = jit.int("INPUT_OFFSET_X")?;
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    for_each_logical(&output, |b, f, oy, ox| {
        let mut acc = if is_max { f64::NEG_INFINITY } else { 0.0 };
        let mut seen = 0usize;
        for ky in 0..size_y {
            for kx in 0..size_x {
                let iy = (oy * stride_y + ky) as i64 + off_y;
                let ix = (ox * stride_x + kx) as i64 + off_x;
                if iy < 0 || iy >= input.y as i64 || ix < 0 || ix >= input.x as i64 {
                    continue;
                }
                let v = src.get(input.at(b, f, iy as usize, ix as usize));
                if is_max {
                    acc = acc.max(v);
                } else {
                    acc += v;
                    seen += 1;
                }
            }
        }
        let v = if is_max {
            if acc == f64::NEG_INFINITY {
                0.0
            } else {
                acc
            }
        } else if seen > 0 {
            acc / seen as f64
        } else {
            0.0
        };
        dst.set(output.at(b, f, oy, ox), v);
    });
    Ok(())
}

fn lrn(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let local = jit.int("LOCAL_SIZE")? as i64;
    let local_elements = jit.int("LOCAL_ELEMENTS")? as f64;
    let across = jit.int("ACROSS_CHANNEL")? != 0;
    let k = jit.float("K")? as f64;
    let alpha = jit.float("ALPHA")? as f64;
    let beta = jit.float("BETA")? as f64;
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    for_each_logical(&input, |b, f, y, x| {
        let mut sum = 0.0f64;
        if across {
            let lo = f as i64 - local / 2;
            for i in 0..local {
                let cf = lo + i;
                if cf < 0 || cf >= input.f as i64 {
                    continue;
                }
                let v = src.get(input.at(b, cf as usize, y, x));
                sum += v * v;
            }
        } else {
            let ly = y as i64 - local / 2;
            let lx = x as i64 - local / 2;
            for iy in 0..local {
                for ix in 0..local {
                    let cy = ly + iy;
                    let cx = lx + ix;
                    if cy < 0 || cy >= input.y as i64 || cx < 0 || cx >= input.x as i64 {
                        continue;
                    }
                    let v = src.get(input.at(b, f, cy as usize, cx as usize));
                    sum += v * v;
                }
            }
        }
        let v = src.get(input.at(b, f, y, x));
        dst.set(output.at(b, f, y, x), v * (k + alpha * sum / local_elements).powf(-beta));
    });
    Ok(())
}

fn normalize(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let across = jit.int("ACROSS_SPATIAL")? != 0;
    let per_feature = jit.int("SCALE_PER_FEATURE")? != 0;
    let epsilon = jit.float("EPSILON")? as f64;
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    let scales = mem(args, 2)?.scalars();
    for b in 0..input.b {
        if across {
            let mut norm = 0.0f64;
            for f in 0..input.f {
                for y in 0..input.y {
                    for x in 0..input.x {
                        let v = src.get(input.at(b, f, y, x));
                        norm += v * v;
                    }
                }
            }
            let inv = 1.0 / (norm + epsilon).sqrt();
            for f in 0..input.f {
                let s = scales.get(if per_feature { f } else { 0 });
                for y in 0..input.y {
                    for x in 0..input.x {
                        dst.set(output.at(b, f, y, x), src.get(input.at(b, f, y, x)) * inv * s);
                    }
                }
            }
        } else {
            for y in 0..input.y {
                for x in 0..input.x {
                    let mut norm = 0.0f64;
                    for f in 0..input.f {
                        let v = src.get(input.at(b, f, y, x));
                        norm += v * v;
                    }
                    let inv = 1.0 / (norm + epsilon).sqrt();
                    for f in 0..input.f {
                        let s = scales.get(if per_feature { f } else { 0 });
                        dst.set(output.at(b, f, y, x), src.get(input.at(b, f, y, x)) * inv * s);
                    }
                }
            }
        }
    }
    Ok(())
}

fn permute(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let order = [
        jit.int("PERMUTE_ORDER_0")? as usize,
        jit.int("PERMUTE_ORDER_1")? as usize,
        jit.int("PERMUTE_ORDER_2")? as usize,
        jit.int("PERMUTE_ORDER_3")? as usize,
    ];
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    for_each_logical(&input, |b, f, y, x| {
        let s = [b, f, y, x];
        dst.set(
            output.at(s[order[0]], s[order[1]], s[order[2]], s[order[3]]),
            src.get(input.at(b, f, y, x)),
        );
    });
    Ok(())
}

fn upsampling(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let scale = jit.int("SCALE")? as usize;
    let bilinear = jit.int("BILINEAR")? != 0;
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    for_each_logical(&output, |b, f, oy, ox| {
        let v = if bilinear {
            let fy = (oy as f64 + 0.5) / scale as f64 - 0.5;
            let fx = (ox as f64 + 0.5) / scale as f64 - 0.5;
            let y0 = (fy.floor() as i64).max(0) as usize;
            let x0 = (fx.floor() as i64).max(0) as usize;
            let y1 = (y0 + 1).min(input.y - 1);
            let x1 = (x0 + 1).min(input.x - 1);
            let wy = fy - fy.floor();
            let wx = fx - fx.floor();
            (1.0 - wy)
                * ((1.0 - wx) * src.get(input.at(b, f, y0, x0))
                    + wx * src.get(input.at(b, f, y0, x1)))
                + wy * ((1.0 - wx) * src.get(input.at(b, f, y1, x0))
                    + wx * src.get(input.at(b, f, y1, x1)))
        } else {
            src.get(input.at(b, f, oy / scale, ox / scale))
        };
        dst.set(output.at(b, f, oy, ox), v);
    });
    Ok(())
}

fn softmax_dim(jit: &JitConstants) -> SoftmaxDim {
    if jit.is_defined("SOFTMAX_DIM_X") {
        SoftmaxDim::X
    } else if jit.is_defined("SOFTMAX_DIM_YX") {
        SoftmaxDim::Yx
    } else if jit.is_defined("SOFTMAX_DIM_FYX") {
        SoftmaxDim::Fyx
    } else {
        SoftmaxDim::Bfyx
    }
}

fn softmax(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let (group_axes, elem_axes) = dim_axes(softmax_dim(jit));
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();

    let group_sizes = axis_sizes(&input, group_axes);
    let elem_sizes = axis_sizes(&input, elem_axes);
    let groups: usize = group_sizes.iter().product::<usize>().max(1);
    let elems: usize = elem_sizes.iter().product::<usize>().max(1);

    for g in 0..groups {
        let gc = coords(group_axes, &unflatten(g, &group_sizes));
        let mut max_val = f64::NEG_INFINITY;
        for i in 0..elems {
            let c = merge_coords(gc, coords(elem_axes, &unflatten(i, &elem_sizes)));
            max_val = max_val.max(src.get(input.at(c[0], c[1], c[2], c[3])));
        }
        let mut denom = 0.0f64;
        for i in 0..elems {
            let c = merge_coords(gc, coords(elem_axes, &unflatten(i, &elem_sizes)));
            denom += (src.get(input.at(c[0], c[1], c[2], c[3])) - max_val).exp();
        }
        for i in 0..elems {
            let c = merge_coords(gc, coords(elem_axes, &unflatten(i, &elem_sizes)));
            let e = (src.get(input.at(c[0], c[1], c[2], c[3])) - max_val).exp();
            dst.set(output.at(c[0], c[1], c[2], c[3]), e / denom);
        }
    }
    Ok(())
}

fn arg_axis(jit: &JitConstants) -> Option<Axis> {
    if jit.is_defined("AXIS_BATCH") {
        Some(Axis::Batch)
    } else if jit.is_defined("AXIS_FEATURE") {
        Some(Axis::Feature)
    } else if jit.is_defined("AXIS_Y") {
        Some(Axis::Y)
    } else if jit.is_defined("AXIS_X") {
        Some(Axis::X)
    } else {
        None
    }
}

fn arg_max_min(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let top_k = jit.int("TOP_K")? as usize;
    let is_max = jit.int("ARG_MAX")? != 0;
    let axis = arg_axis(jit);
    let (group_axes, reduced) = reduction_axes(axis);
    let out_axis = match axis {
        Some(a) => vec![a],
        None => vec![Axis::X],
    };

    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();

    let group_sizes = axis_sizes(&input, &group_axes);
    let elem_sizes = axis_sizes(&input, &reduced);
    let groups: usize = group_sizes.iter().product::<usize>().max(1);
    let span: usize = elem_sizes.iter().product::<usize>().max(1);

    for g in 0..groups {
        let gc = coords(&group_axes, &unflatten(g, &group_sizes));
        let mut ranked: Vec<(usize, f64)> = (0..span)
            .map(|i| {
                let c = merge_coords(gc, coords(&reduced, &unflatten(i, &elem_sizes)));
                (i, src.get(input.at(c[0], c[1], c[2], c[3])))
            })
            .collect();
        // stable: equal values keep the lower index first
        ranked.sort_by(|a, b| {
            let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
            if is_max {
                ord.reverse().then(a.0.cmp(&b.0))
            } else {
                ord.then(a.0.cmp(&b.0))
            }
        });
        for k in 0..top_k {
            let oc = merge_coords(gc, coords(&out_axis, &[k]));
            dst.set(output.at(oc[0], oc[1], oc[2], oc[3]), ranked[k].0 as f64);
        }
    }
    Ok(())
}

fn lookup_table(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let indices_geom = Geom::parse(jit, "INPUT1")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let axis = arg_axis(jit);
    let (group_axes, reduced) = reduction_axes(axis);
    let out_axis = match axis {
        Some(a) => vec![a],
        None => vec![Axis::X],
    };

    let src = mem(args, 0)?.scalars();
    let indices = mem(args, 1)?.scalars();
    let mut dst = mem(args, 2)?.scalars_mut();

    let group_sizes = axis_sizes(&input, &group_axes);
    let elem_sizes = axis_sizes(&input, &reduced);
    let per_group: usize =
        out_axis.iter().map(|a| indices_geom.size(*a)).product::<usize>().max(1);
    let groups: usize = group_sizes.iter().product::<usize>().max(1);

    for g in 0..groups {
        let gc = coords(&group_axes, &unflatten(g, &group_sizes));
        for k in 0..per_group {
            let kc = merge_coords(gc, coords(&out_axis, &[k]));
            let idx = indices.get(indices_geom.at(kc[0], kc[1], kc[2], kc[3])) as usize;
            let sc = merge_coords(gc, coords(&reduced, &unflatten(idx, &elem_sizes)));
            dst.set(
                output.at(kc[0], kc[1], kc[2], kc[3]),
                src.get(input.at(sc[0], sc[1], sc[2], sc[3])),
            );
        }
    }
    Ok(())
}

fn index_select(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let axis = arg_axis(jit).ok_or_else(|| OxError::CompileError {
        log: "index_select kernel compiled without an axis flag".into(),
    })?;
    let src = mem(args, 0)?.scalars();
    let indices = mem(args, 1)?.scalars();
    let mut dst = mem(args, 2)?.scalars_mut();
    for_each_logical(&output, |b, f, y, x| {
        let along = match axis {
            Axis::Batch => b,
            Axis::Feature => f,
            Axis::Y => y,
            Axis::X => x,
        };
        let gathered = indices.get(along) as usize;
        let mut c = [b, f, y, x];
        match axis {
            Axis::Batch => c[0] = gathered,
            Axis::Feature => c[1] = gathered,
            Axis::Y => c[2] = gathered,
            Axis::X => c[3] = gathered,
        }
        dst.set(output.at(b, f, y, x), src.get(input.at(c[0], c[1], c[2], c[3])));
    });
    Ok(())
}

fn region_yolo(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let coords_n = jit.int("COORDS")? as usize;
    let classes = jit.int("CLASSES")? as usize;
    let anchors = jit.int("ANCHOR_NUM")? as usize;
    let do_softmax = jit.int("DO_SOFTMAX")? != 0;
    let stride = coords_n + classes + 1;
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    let logistic = |v: f64| 1.0 / (1.0 + (-v).exp());

    for b in 0..input.b {
        for anchor in 0..anchors {
            for y in 0..input.y {
                for x in 0..input.x {
                    for c in 0..stride {
                        let f = anchor * stride + c;
                        let mut v = src.get(input.at(b, f, y, x));
                        if c < 2 || c == coords_n {
                            v = logistic(v);
                        }
                        dst.set(output.at(b, f, y, x), v);
                    }
                    if do_softmax {
                        let base = anchor * stride + coords_n + 1;
                        let mut max_val = f64::NEG_INFINITY;
                        for c in 0..classes {
                            max_val = max_val.max(dst_get(&dst, &output, b, base + c, y, x));
                        }
                        let mut denom = 0.0;
                        for c in 0..classes {
                            let e = (dst_get(&dst, &output, b, base + c, y, x) - max_val).exp();
                            dst.set(output.at(b, base + c, y, x), e);
                            denom += e;
                        }
                        for c in 0..classes {
                            let e = dst_get(&dst, &output, b, base + c, y, x);
                            dst.set(output.at(b, base + c, y, x), e / denom);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

// read-back from a write view; the yolo softmax rewrites its own output
fn dst_get(
    view: &crate::memory::ScalarViewMut<'_>,
    g: &Geom,
    b: usize,
    f: usize,
    y: usize,
    x: usize,
) -> f64 {
    view.get(g.at(b, f, y, x))
}

fn reorder(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let per_feature = jit.int("SUBTRACT_PER_FEATURE")? != 0;
    let mean_memory = jit.int("SUBTRACT_MEAN_MEMORY")? != 0;
    let subtract_vals: Vec<f64> = if per_feature {
        let n = jit.int("SUBTRACT_VAL_COUNT")? as usize;
        (0..n)
            .map(|f| jit.float(&format!("SUBTRACT_VAL_{f}")).map(|v| v as f64))
            .collect::<OxResult<_>>()?
    } else {
        Vec::new()
    };
    let src = mem(args, 0)?.scalars();
    let mut dst = mem(args, 1)?.scalars_mut();
    let mean = if mean_memory {
        Some((Geom::parse(jit, "MEAN")?, mem(args, 2)?.scalars()))
    } else {
        None
    };
    for_each_logical(&input, |b, f, y, x| {
        let mut v = src.get(input.at(b, f, y, x));
        if per_feature {
            v -= subtract_vals.get(f).copied().unwrap_or(0.0);
        } else if let Some((mg, means)) = &mean {
            v -= means.get(mg.at(0, f % mg.f, y % mg.y, x % mg.x));
        }
        dst.set(output.at(b, f, y, x), v);
    });
    Ok(())
}

fn roi_pooling(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let input = Geom::parse(jit, "INPUT0")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let pooled_h = jit.int("POOLED_HEIGHT")? as usize;
    let pooled_w = jit.int("POOLED_WIDTH")? as usize;
    let spatial_scale = jit.float("SPATIAL_SCALE")? as f64;
    let src = mem(args, 0)?.scalars();
    let rois = mem(args, 1)?.scalars();
    let mut dst = mem(args, 2)?.scalars_mut();

    for roi in 0..output.b {
        let rb = rois.get(roi * 5) as usize;
        let x0 = (rois.get(roi * 5 + 1) * spatial_scale).round() as i64;
        let y0 = (rois.get(roi * 5 + 2) * spatial_scale).round() as i64;
        let x1 = (rois.get(roi * 5 + 3) * spatial_scale).round() as i64;
        let y1 = (rois.get(roi * 5 + 4) * spatial_scale).round() as i64;
        let roi_w = (x1 - x0 + 1).max(1);
        let roi_h = (y1 - y0 + 1).max(1);
        for f in 0..output.f {
            for py in 0..pooled_h {
                for px in 0..pooled_w {
                    let hstart = y0 + (py as i64 * roi_h) / pooled_h as i64;
                    let hend = y0 + ((py as i64 + 1) * roi_h + pooled_h as i64 - 1) / pooled_h as i64;
                    let wstart = x0 + (px as i64 * roi_w) / pooled_w as i64;
                    let wend = x0 + ((px as i64 + 1) * roi_w + pooled_w as i64 - 1) / pooled_w as i64;
                    let mut acc = f64::NEG_INFINITY;
                    for iy in hstart.max(0)..hend.min(input.y as i64) {
                        for ix in wstart.max(0)..wend.min(input.x as i64) {
                            acc = acc.max(src.get(input.at(rb, f, iy as usize, ix as usize)));
                        }
                    }
                    let v = if acc == f64::NEG_INFINITY { 0.0 } else { acc };
                    dst.set(output.at(roi, f, py, px), v);
                }
            }
        }
    }
    Ok(())
}

fn simpler_nms(jit: &JitConstants, args: &[RuntimeArg]) -> OxResult<()> {
    let scores_geom = Geom::parse(jit, "INPUT0")?;
    let bbox_geom = Geom::parse(jit, "INPUT1")?;
    let output = Geom::parse(jit, "OUTPUT")?;
    let feature_stride = jit.int("FEATURE_STRIDE")? as f64;
    let min_box_size = jit.int("MIN_BOX_SIZE")? as f64;
    let pre_nms_topn = jit.int("PRE_NMS_TOPN")? as usize;
    let post_nms_topn = jit.int("POST_NMS_TOPN")? as usize;
    let iou_threshold = jit.float("IOU_THRESHOLD")? as f64;
    let scales: Vec<f64> = (0..jit.int("SCALES_NUM")? as usize)
        .map(|i| jit.float(&format!("SCALE_{i}")).map(|v| v as f64))
        .collect::<OxResult<_>>()?;
    let ratios: Vec<f64> = (0..jit.int("RATIOS_NUM")? as usize)
        .map(|i| jit.float(&format!("RATIO_{i}")).map(|v| v as f64))
        .collect::<OxResult<_>>()?;

    let scores = mem(args, 0)?.scalars();
    let bbox = mem(args, 1)?.scalars();
    let info = mem(args, 2)?.scalars();
    let mut dst = mem(args, 3)?.scalars_mut();

    let img_h = info.get(0);
    let img_w = info.get(1);
    let anchors_n = scales.len() * ratios.len();

    // anchor boxes centred on the stride grid, then shifted by the deltas
    let mut proposals: Vec<(f64, [f64; 4])> = Vec::new();
    for y in 0..scores_geom.y {
        for x in 0..scores_geom.x {
            for (a, (ratio, scale)) in ratios
                .iter()
                .flat_map(|r| scales.iter().map(move |s| (*r, *s)))
                .enumerate()
            {
                let base = feature_stride;
                let w = base * scale * (1.0 / ratio).sqrt();
                let h = base * scale * ratio.sqrt();
                let cx = x as f64 * feature_stride + feature_stride / 2.0;
                let cy = y as f64 * feature_stride + feature_stride / 2.0;

                // foreground scores sit in the second half of the feature axis
                let score = scores.get(scores_geom.at(0, anchors_n + a, y, x));
                let dx = bbox.get(bbox_geom.at(0, a * 4, y, x));
                let dy = bbox.get(bbox_geom.at(0, a * 4 + 1, y, x));
                let dw = bbox.get(bbox_geom.at(0, a * 4 + 2, y, x));
                let dh = bbox.get(bbox_geom.at(0, a * 4 + 3, y, x));

                let pcx = cx + dx * w;
                let pcy = cy + dy * h;
                let pw = w * dw.exp();
                let ph = h * dh.exp();

                let x0 = (pcx - pw / 2.0).clamp(0.0, img_w - 1.0);
                let y0 = (pcy - ph / 2.0).clamp(0.0, img_h - 1.0);
                let x1 = (pcx + pw / 2.0).clamp(0.0, img_w - 1.0);
                let y1 = (pcy + ph / 2.0).clamp(0.0, img_h - 1.0);
                if x1 - x0 + 1.0 >= min_box_size && y1 - y0 + 1.0 >= min_box_size {
                    proposals.push((score, [x0, y0, x1, y1]));
                }
            }
        }
    }

    proposals.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    proposals.truncate(pre_nms_topn);

    let iou = |a: &[f64; 4], b: &[f64; 4]| -> f64 {
        let ix = (a[2].min(b[2]) - a[0].max(b[0]) + 1.0).max(0.0);
        let iy = (a[3].min(b[3]) - a[1].max(b[1]) + 1.0).max(0.0);
        let inter = ix * iy;
        let area_a = (a[2] - a[0] + 1.0) * (a[3] - a[1] + 1.0);
        let area_b = (b[2] - b[0] + 1.0) * (b[3] - b[1] + 1.0);
        inter / (area_a + area_b - inter)
    };

    let mut kept: Vec<[f64; 4]> = Vec::new();
    for (_, boxed) in &proposals {
        if kept.len() >= post_nms_topn {
            break;
        }
        if kept.iter().all(|k| iou(k, boxed) <= iou_threshold) {
            kept.push(*boxed);
        }
    }

    for (roi, boxed) in kept.iter().enumerate() {
        dst.set(output.at(roi, 0, 0, 0), 0.0);
        for (i, v) in boxed.iter().enumerate() {
            dst.set(output.at(roi, 0, 0, i + 1), *v);
        }
    }
    Ok(())
}
