//! JIT constant generation: the preprocessor definitions prepended to a
//! kernel template before device compilation. Every tensor argument gets a
//! prefixed geometry block so one template serves many shapes and layouts.

use crate::errors::{OxError, OxResult};
use crate::tensor::Layout;
use crate::topology::{ActivationFunc, ActivationInfo};
use crate::types::DataType;

/// An ordered name → value table of preprocessor definitions.
#[derive(Debug, Clone, Default)]
pub struct JitConstants {
    defs: Vec<(String, String)>,
}

impl JitConstants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.defs.push((name.into(), value.into()));
    }

    pub fn add_int(&mut self, name: impl Into<String>, value: i64) {
        self.add(name, value.to_string());
    }

    pub fn add_float(&mut self, name: impl Into<String>, value: f32) {
        self.add(name, float_code(value));
    }

    pub fn merge(&mut self, other: JitConstants) {
        self.defs.extend(other.defs);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.defs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn int(&self, name: &str) -> OxResult<i64> {
        let text = self
            .get(name)
            .ok_or_else(|| OxError::CompileError { log: format!("missing jit constant {name}") })?;
        text.parse::<i64>().map_err(|_| OxError::CompileError {
            log: format!("jit constant {name}={text} is not an integer"),
        })
    }

    pub fn int_or(&self, name: &str, default: i64) -> i64 {
        self.int(name).unwrap_or(default)
    }

    pub fn float(&self, name: &str) -> OxResult<f32> {
        let text = self
            .get(name)
            .ok_or_else(|| OxError::CompileError { log: format!("missing jit constant {name}") })?;
        parse_float_code(text).ok_or_else(|| OxError::CompileError {
            log: format!("jit constant {name}={text} is not a float"),
        })
    }

    /// `#define` prefix prepended to the kernel template.
    pub fn to_source_prefix(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.defs {
            out.push_str("#define ");
            out.push_str(name);
            out.push(' ');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Formats a float as kernel source text. Decimal scientific notation with
/// an `f` suffix round-trips through both the device compiler and the
/// reference executor's parser.
pub fn float_code(value: f32) -> String {
    if value.is_infinite() {
        return if value > 0.0 { "INFINITY".into() } else { "-INFINITY".into() };
    }
    format!("{value:e}f")
}

pub(crate) fn parse_float_code(text: &str) -> Option<f32> {
    match text {
        "INFINITY" => Some(f32::INFINITY),
        "-INFINITY" => Some(f32::NEG_INFINITY),
        other => other.trim_end_matches('f').parse::<f32>().ok(),
    }
}

/// Geometry block for a data tensor: sizes, pitches, padding and base
/// offset under the given prefix (INPUT0, OUTPUT, ...).
pub fn tensor_jit(prefix: &str, layout: &Layout) -> JitConstants {
    let mut jit = JitConstants::new();
    let size = layout.size;
    let pitches = layout.pitches();
    jit.add_int(format!("{prefix}_BATCH_NUM"), size.batch as i64);
    jit.add_int(format!("{prefix}_FEATURE_NUM"), size.feature as i64);
    jit.add_int(format!("{prefix}_SIZE_Y"), size.y as i64);
    jit.add_int(format!("{prefix}_SIZE_X"), size.x as i64);
    jit.add_int(format!("{prefix}_PITCH_BATCH"), pitches.batch as i64);
    jit.add_int(format!("{prefix}_PITCH_FEATURE"), pitches.feature as i64);
    jit.add_int(format!("{prefix}_PITCH_Y"), pitches.y as i64);
    jit.add_int(format!("{prefix}_PITCH_X"), pitches.x as i64);
    jit.add_int(format!("{prefix}_PAD_LOWER_BATCH"), layout.padding.lower.batch as i64);
    jit.add_int(format!("{prefix}_PAD_LOWER_FEATURE"), layout.padding.lower.feature as i64);
    jit.add_int(format!("{prefix}_PAD_LOWER_Y"), layout.padding.lower.y as i64);
    jit.add_int(format!("{prefix}_PAD_LOWER_X"), layout.padding.lower.x as i64);
    jit.add_int(format!("{prefix}_PAD_UPPER_BATCH"), layout.padding.upper.batch as i64);
    jit.add_int(format!("{prefix}_PAD_UPPER_FEATURE"), layout.padding.upper.feature as i64);
    jit.add_int(format!("{prefix}_PAD_UPPER_Y"), layout.padding.upper.y as i64);
    jit.add_int(format!("{prefix}_PAD_UPPER_X"), layout.padding.upper.x as i64);
    jit.add_int(format!("{prefix}_OFFSET"), layout.base_offset() as i64);
    jit.add(format!("{prefix}_TYPE"), layout.data_type.code_name());
    jit.add(
        format!("{prefix}_LAYOUT_{}", layout.format.tag().to_uppercase()),
        "1",
    );
    jit
}

/// Geometry block for a weights tensor: OFM/IFM naming, plus the layout
/// tag blocked kernels dispatch on.
pub fn filter_jit(prefix: &str, layout: &Layout) -> JitConstants {
    let mut jit = JitConstants::new();
    let size = layout.size;
    let pitches = layout.pitches();
    jit.add_int(format!("{prefix}_OFM_NUM"), size.batch as i64);
    jit.add_int(format!("{prefix}_IFM_NUM"), size.feature as i64);
    jit.add_int(format!("{prefix}_SIZE_Y"), size.y as i64);
    jit.add_int(format!("{prefix}_SIZE_X"), size.x as i64);
    jit.add_int(format!("{prefix}_PITCH_OFM"), pitches.batch as i64);
    jit.add_int(format!("{prefix}_PITCH_IFM"), pitches.feature as i64);
    jit.add_int(format!("{prefix}_PITCH_Y"), pitches.y as i64);
    jit.add_int(format!("{prefix}_PITCH_X"), pitches.x as i64);
    jit.add_int(format!("{prefix}_OFFSET"), layout.base_offset() as i64);
    jit.add(format!("{prefix}_TYPE"), layout.data_type.code_name());
    jit.add(
        format!("{prefix}_LAYOUT_{}", layout.format.tag().to_uppercase()),
        "1",
    );
    jit
}

/// Numeric constants of the computation type: zero/one and the finite
/// range, spelled in the type itself.
pub fn unit_jit(data_type: DataType) -> JitConstants {
    let mut jit = JitConstants::new();
    jit.add("UNIT_TYPE", data_type.code_name());
    if data_type.is_float() {
        jit.add("UNIT_VAL_ZERO", "0.0f");
        jit.add("UNIT_VAL_ONE", "1.0f");
        jit.add_float("UNIT_VAL_MAX", data_type.max_value() as f32);
        jit.add_float("UNIT_VAL_MIN", data_type.min_value() as f32);
    } else {
        jit.add("UNIT_VAL_ZERO", "0");
        jit.add("UNIT_VAL_ONE", "1");
        jit.add_int("UNIT_VAL_MAX", data_type.max_value() as i64);
        jit.add_int("UNIT_VAL_MIN", data_type.min_value() as i64);
    }
    jit
}

/// Builds the body of a function-like `(g, i)` indexing macro: `g` walks
/// `group_axes` (outermost first), `i` walks `elem_axes`, and each index
/// lands on its axis pitch in the given layout. Grouped kernels (softmax,
/// argmax, lookup) address both tensors through one such macro.
pub fn group_macro(layout: &Layout, group_axes: &[crate::tensor::Axis], elem_axes: &[crate::tensor::Axis]) -> String {
    let pitches = layout.pitches();
    let mut expr = format!("({}", layout.base_offset());
    let mut emit = |var: &str, axes: &[crate::tensor::Axis]| {
        for (k, axis) in axes.iter().enumerate() {
            let div: usize = axes[k + 1..].iter().map(|a| layout.size.get(*a)).product();
            let size = layout.size.get(*axis);
            let pitch = pitches.get(*axis);
            expr.push_str(&format!(" + ((({var}) / {div}) % {size}) * {pitch}"));
        }
    };
    emit("g", group_axes);
    emit("i", elem_axes);
    expr.push(')');
    expr
}

/// Standard jit block shared by every lowered primitive: unit constants of
/// the computation type, geometry of every input and the output, and the
/// fused-activation flags.
pub fn base_jit(params: &crate::kernels::BaseParams) -> JitConstants {
    let mut jit = unit_jit(params.output.data_type);
    for (i, layout) in params.inputs.iter().enumerate() {
        jit.merge(tensor_jit(&format!("INPUT{i}"), layout));
    }
    jit.merge(tensor_jit("OUTPUT", &params.output));
    jit.merge(activation_jit(params.activation.as_ref()));
    jit
}

/// Dispatch geometry covering one work item per logical output element,
/// laid out as (x, y, batch*feature).
pub fn gws_per_element(layout: &Layout) -> [usize; 3] {
    let s = layout.size;
    [s.x.max(1), s.y.max(1), (s.batch * s.feature).max(1)]
}

/// Activation flags: which function is fused, and its slope.
pub fn activation_jit(activation: Option<&ActivationInfo>) -> JitConstants {
    let mut jit = JitConstants::new();
    match activation {
        None => jit.add_int("FUSED_ACTIVATION", 0),
        Some(info) => {
            jit.add_int("FUSED_ACTIVATION", 1);
            let name = match info.func {
                ActivationFunc::Relu => "ACTIVATION_RELU",
                ActivationFunc::Sigmoid => "ACTIVATION_SIGMOID",
                ActivationFunc::Tanh => "ACTIVATION_TANH",
            };
            jit.add(name, "1");
            jit.add_float("NEGATIVE_SLOPE", info.slope);
        }
    }
    jit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Format, TensorShape};

    #[test]
    fn float_code_round_trips() {
        for v in [0.0f32, 1.0, -0.5, 0.1, 3.14159, 1e-7, -2.5e8] {
            let code = float_code(v);
            assert!(code.ends_with('f'), "{code}");
            assert_eq!(parse_float_code(&code), Some(v));
        }
        assert_eq!(parse_float_code(&float_code(f32::INFINITY)), Some(f32::INFINITY));
    }

    #[test]
    fn tensor_jit_carries_geometry() {
        let layout = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(2, 3, 4, 5));
        let jit = tensor_jit("INPUT0", &layout);
        assert_eq!(jit.int("INPUT0_SIZE_X").unwrap(), 5);
        assert_eq!(jit.int("INPUT0_PITCH_FEATURE").unwrap(), 20);
        assert_eq!(jit.int("INPUT0_OFFSET").unwrap(), 0);
        assert!(jit.is_defined("INPUT0_LAYOUT_BFYX"));
        let prefix = jit.to_source_prefix();
        assert!(prefix.contains("#define INPUT0_SIZE_X 5\n"));
    }

    #[test]
    fn unit_jit_for_floats_and_ints() {
        let f = unit_jit(DataType::F32);
        assert_eq!(f.get("UNIT_TYPE"), Some("float"));
        assert_eq!(f.get("UNIT_VAL_ONE"), Some("1.0f"));
        let i = unit_jit(DataType::I8);
        assert_eq!(i.int("UNIT_VAL_MAX").unwrap(), 127);
    }
}
