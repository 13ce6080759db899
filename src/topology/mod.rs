pub mod primitives;

pub use primitives::*;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{OxError, OxResult};
use crate::tensor::Padding;
use crate::types::PrimitiveId;

/// Immutable description of one operator: a unique id, its kind-specific
/// parameters, the primitives it consumes, and an optional explicit output
/// padding folded into its resolved layout at build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveDesc {
    pub id: PrimitiveId,
    pub kind: PrimitiveKind,
    pub inputs: Vec<PrimitiveId>,
    pub output_padding: Padding,
}

impl PrimitiveDesc {
    pub fn new(
        id: impl Into<PrimitiveId>,
        kind: PrimitiveKind,
        inputs: Vec<PrimitiveId>,
    ) -> Self {
        Self { id: id.into(), kind, inputs, output_padding: Padding::zero() }
    }

    pub fn with_output_padding(mut self, padding: Padding) -> Self {
        self.output_padding = padding;
        self
    }

    /// All primitives this description depends on: visible inputs first,
    /// then parameter-referenced tensors (weights, bias, mean, scale).
    pub fn dependencies(&self) -> Vec<PrimitiveId> {
        let mut deps = self.inputs.clone();
        deps.extend(self.kind.hidden_inputs());
        deps
    }
}

/// A bag of primitive descriptions. Ids must be unique; references are
/// checked when the topology is compiled into a program, so primitives may
/// be added in any order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    descs: Vec<PrimitiveDesc>,
    #[serde(skip)]
    index: HashMap<PrimitiveId, usize>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, desc: PrimitiveDesc) -> OxResult<()> {
        if self.index.contains_key(&desc.id) || self.descs.iter().any(|d| d.id == desc.id) {
            return Err(OxError::InvalidArgument(format!(
                "duplicate primitive id '{}'",
                desc.id
            )));
        }
        self.index.insert(desc.id.clone(), self.descs.len());
        self.descs.push(desc);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PrimitiveDesc> {
        if let Some(&i) = self.index.get(id) {
            return self.descs.get(i);
        }
        // index is skipped by serde; fall back to a scan after deserialize
        self.descs.iter().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrimitiveDesc> {
        self.descs.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &PrimitiveId> {
        self.descs.iter().map(|d| &d.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Format, Layout, TensorShape};
    use crate::types::DataType;

    fn input_desc(id: &str) -> PrimitiveDesc {
        PrimitiveDesc::new(
            id,
            PrimitiveKind::InputLayout(InputLayoutParams {
                layout: Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 1, 2, 2)),
            }),
            vec![],
        )
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut topo = Topology::new();
        topo.add(input_desc("in")).unwrap();
        let err = topo.add(input_desc("in")).unwrap_err();
        assert!(matches!(err, OxError::InvalidArgument(_)));
    }

    #[test]
    fn forward_references_are_allowed_at_add_time() {
        let mut topo = Topology::new();
        topo.add(PrimitiveDesc::new(
            "act",
            PrimitiveKind::Activation(ActivationParams { info: ActivationInfo::relu() }),
            vec!["in".into()],
        ))
        .unwrap();
        topo.add(input_desc("in")).unwrap();
        assert_eq!(topo.len(), 2);
    }

    #[test]
    fn hidden_inputs_extend_dependencies() {
        let desc = PrimitiveDesc::new(
            "conv",
            PrimitiveKind::Convolution(ConvolutionParams {
                weights: vec!["w".into()],
                bias: vec!["b".into()],
                stride: (1, 1),
                dilation: (1, 1),
                input_offset: (0, 0),
                split: 1,
                with_activation: None,
            }),
            vec!["in".into()],
        );
        assert_eq!(desc.dependencies(), vec!["in", "w", "b"]);
    }
}
