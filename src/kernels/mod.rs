pub mod jit;
pub mod source_db;

pub mod activation;
pub mod arg_max_min;
pub mod batch_norm;
pub mod concatenation;
pub mod convolution;
pub mod crop;
pub mod custom;
pub mod deconvolution;
pub mod eltwise;
pub mod fully_connected;
pub mod index_select;
pub mod lookup_table;
pub mod lrn;
pub mod mean_subtract;
pub mod normalize;
pub mod permute;
pub mod pooling;
pub mod region_yolo;
pub mod reorder;
pub mod roi_pooling;
pub mod scale;
pub mod simpler_nms;
pub mod softmax;
pub mod upsampling;

use std::time::Duration;

use crate::errors::{OxError, OxResult};
use crate::tensor::{Format, Layout};
use crate::topology::ActivationInfo;
use crate::types::ScalarValue;

pub use jit::JitConstants;

/// Coarse efficiency grade a candidate advertises for a parameter set.
/// Lower compares as better; forced priorities outrank `Default`, which
/// outranks last-resort candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KernelPriority {
    Force(u8),
    Default,
    DontUseIfHaveSomethingElse,
}

/// Which runtime object to bind to a kernel argument slot. Binding walks
/// this descriptor in order, pulling from the executing node's inputs,
/// output, constants and scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKind {
    /// N-th dependency of the node, in edge order.
    Input(usize),
    Output,
    /// Weights constant; the running split selects which one.
    Weights,
    /// Bias constant; the running split selects which one.
    Bias,
    /// N-th static scalar from the kernel data.
    Scalar(usize),
    /// The running split index, bound per enqueue.
    SplitIndex,
}

/// Request to transform the weights constant into a different layout
/// before first execution.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightsReorder {
    pub target: Layout,
}

/// Request to receive a data input through a different format. The
/// pipeline honours it by injecting the corresponding reorder in front of
/// the consumer and rerunning selection against the transformed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputReorder {
    /// Position of the visible data input to transform.
    pub input: usize,
    pub target: Format,
}

/// A fully parameterised kernel: everything the engine needs to compile
/// and enqueue it.
#[derive(Debug, Clone)]
pub struct KernelData {
    /// Name of the source template in the primitive database.
    pub template: &'static str,
    pub entry_point: String,
    pub jit: JitConstants,
    pub gws: [usize; 3],
    pub lws: Option<[usize; 3]>,
    pub arguments: Vec<ArgumentKind>,
    pub scalars: Vec<ScalarValue>,
    pub weights_reorder: Option<WeightsReorder>,
    /// Input transforms this kernel wants before it can run.
    pub input_reorders: Vec<InputReorder>,
    /// User-supplied source overriding the template database.
    pub custom_source: Option<String>,
    /// Rough time estimate used only to break ties inside a priority
    /// bucket when no tuning oracle is available.
    pub estimated_time: f32,
}

impl KernelData {
    pub fn new(template: &'static str, entry_point: impl Into<String>) -> Self {
        Self {
            template,
            entry_point: entry_point.into(),
            jit: JitConstants::default(),
            gws: [1, 1, 1],
            lws: None,
            arguments: Vec::new(),
            scalars: Vec::new(),
            weights_reorder: None,
            input_reorders: Vec::new(),
            custom_source: None,
            estimated_time: f32::MAX,
        }
    }
}

/// Options threaded from the build into candidate construction.
#[derive(Debug, Clone, Default)]
pub struct OptionalParams {
    /// Decorate entry points with the primitive id for debuggers.
    pub meaningful_kernel_names: bool,
    /// Primitive id, used for decoration and diagnostics.
    pub primitive_id: String,
}

impl OptionalParams {
    /// Entry point name, decorated when the engine asked for meaningful
    /// kernel names.
    pub fn entry_point(&self, base: &str) -> String {
        if self.meaningful_kernel_names && !self.primitive_id.is_empty() {
            format!("{}_{}", base, self.primitive_id.replace(|c: char| !c.is_alphanumeric(), "_"))
        } else {
            base.to_string()
        }
    }
}

/// Shared slice of every lowered parameter set: input/output geometry and
/// the fused activation, all layout-resolved.
#[derive(Debug, Clone)]
pub struct BaseParams {
    pub inputs: Vec<Layout>,
    pub output: Layout,
    pub activation: Option<ActivationInfo>,
}

impl BaseParams {
    pub fn new(inputs: Vec<Layout>, output: Layout) -> Self {
        Self { inputs, output, activation: None }
    }

    pub fn with_activation(mut self, activation: Option<ActivationInfo>) -> Self {
        self.activation = activation;
        self
    }

    pub fn input(&self, i: usize) -> &Layout {
        &self.inputs[i]
    }
}

/// One implementation candidate for a primitive kind.
pub trait KernelBase<P>: Send + Sync {
    fn kernel_name(&self) -> &'static str;

    /// Precondition check over layouts, dtypes and shapes.
    fn supports(&self, params: &P) -> bool;

    fn estimate(&self, _params: &P) -> KernelPriority {
        KernelPriority::Default
    }

    fn build(&self, params: &P, options: &OptionalParams) -> OxResult<KernelData>;
}

/// Tuning oracle: measures a built kernel over representative inputs so
/// selection can rank the top bucket by observed wall time.
pub trait KernelRunner: Send + Sync {
    fn measure(&self, kernel: &KernelData) -> anyhow::Result<Duration>;
}

/// Ordered family of candidates for one primitive kind.
pub struct KernelSelector<P> {
    kind: &'static str,
    candidates: Vec<Box<dyn KernelBase<P>>>,
}

impl<P> KernelSelector<P> {
    pub fn new(kind: &'static str, candidates: Vec<Box<dyn KernelBase<P>>>) -> Self {
        Self { kind, candidates }
    }

    /// Selection policy: drop unsupported candidates, keep the best
    /// priority bucket, rank inside it by the tuning oracle when present
    /// and by (estimated time, registration order) otherwise.
    pub fn select(
        &self,
        params: &P,
        options: &OptionalParams,
        runner: Option<&dyn KernelRunner>,
    ) -> OxResult<KernelData> {
        let viable: Vec<&Box<dyn KernelBase<P>>> =
            self.candidates.iter().filter(|c| c.supports(params)).collect();
        if viable.is_empty() {
            return Err(OxError::UnsupportedConfiguration(format!(
                "{} '{}': no kernel accepts the given parameters",
                self.kind, options.primitive_id
            )));
        }

        let best = viable.iter().map(|c| c.estimate(params)).min().expect("non-empty");
        let bucket: Vec<_> =
            viable.into_iter().filter(|c| c.estimate(params) == best).collect();

        let mut built = Vec::with_capacity(bucket.len());
        for candidate in bucket {
            built.push((candidate.kernel_name(), candidate.build(params, options)?));
        }

        if let Some(runner) = runner {
            let mut ranked: Vec<(Duration, KernelData)> = Vec::new();
            for (name, data) in built {
                match runner.measure(&data) {
                    Ok(elapsed) => ranked.push((elapsed, data)),
                    Err(err) => {
                        tracing::debug!(kernel = name, %err, "tuning run failed, skipping")
                    }
                }
            }
            if let Some(best) = ranked
                .into_iter()
                .min_by_key(|(elapsed, _)| *elapsed)
                .map(|(_, data)| data)
            {
                return Ok(best);
            }
            return Err(OxError::UnsupportedConfiguration(format!(
                "{} '{}': every tuning run failed",
                self.kind, options.primitive_id
            )));
        }

        let winner = built
            .into_iter()
            .enumerate()
            .min_by(|(ia, (_, a)), (ib, (_, b))| {
                a.estimated_time
                    .partial_cmp(&b.estimated_time)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(ia.cmp(ib))
            })
            .map(|(_, (_, data))| data)
            .expect("non-empty bucket");
        Ok(winner)
    }
}
