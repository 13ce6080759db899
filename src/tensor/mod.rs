pub mod layout;

pub use layout::{Format, Layout, Pitches};

use serde::{Deserialize, Serialize};

/// Logical axes of a tensor. Weights tensors reuse the same axes with
/// OFM riding `Batch` and IFM riding `Feature`. The ROI count of a
/// roi-pooling result rides `Batch` as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Batch,
    Feature,
    Y,
    X,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::Batch, Axis::Feature, Axis::Y, Axis::X];

    pub fn name(&self) -> &'static str {
        match self {
            Axis::Batch => "batch",
            Axis::Feature => "feature",
            Axis::Y => "y",
            Axis::X => "x",
        }
    }
}

/// Logical extent of a tensor along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape {
    pub batch: usize,
    pub feature: usize,
    pub y: usize,
    pub x: usize,
}

impl TensorShape {
    pub const fn new(batch: usize, feature: usize, y: usize, x: usize) -> Self {
        Self { batch, feature, y, x }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Number of logical elements.
    pub fn count(&self) -> usize {
        self.batch * self.feature * self.y * self.x
    }

    pub fn spatial(&self) -> usize {
        self.y * self.x
    }

    pub fn get(&self, axis: Axis) -> usize {
        match axis {
            Axis::Batch => self.batch,
            Axis::Feature => self.feature,
            Axis::Y => self.y,
            Axis::X => self.x,
        }
    }

    pub fn set(&mut self, axis: Axis, value: usize) {
        match axis {
            Axis::Batch => self.batch = value,
            Axis::Feature => self.feature = value,
            Axis::Y => self.y = value,
            Axis::X => self.x = value,
        }
    }

    pub fn with_axis(mut self, axis: Axis, value: usize) -> Self {
        self.set(axis, value);
        self
    }

    /// Per-axis sum, used to combine a size with its padding.
    pub fn add(&self, other: &TensorShape) -> TensorShape {
        TensorShape::new(
            self.batch + other.batch,
            self.feature + other.feature,
            self.y + other.y,
            self.x + other.x,
        )
    }

    /// Per-axis maximum.
    pub fn max(&self, other: &TensorShape) -> TensorShape {
        TensorShape::new(
            self.batch.max(other.batch),
            self.feature.max(other.feature),
            self.y.max(other.y),
            self.x.max(other.x),
        )
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}f{}y{}x{}", self.batch, self.feature, self.y, self.x)
    }
}

/// Unused elements surrounding the logical region of a tensor, in elements
/// per axis. `lower` precedes the logical region, `upper` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Padding {
    pub lower: TensorShape,
    pub upper: TensorShape,
}

impl Padding {
    pub const fn zero() -> Self {
        Self { lower: TensorShape::zero(), upper: TensorShape::zero() }
    }

    pub fn new(lower: TensorShape, upper: TensorShape) -> Self {
        Self { lower, upper }
    }

    /// Symmetric spatial padding, the common case for convolution inputs.
    pub fn spatial(y: usize, x: usize) -> Self {
        let t = TensorShape::new(0, 0, y, x);
        Self { lower: t, upper: t }
    }

    pub fn is_zero(&self) -> bool {
        self.lower.count() == 0
            && self.upper.count() == 0
            && self.lower == TensorShape::zero()
            && self.upper == TensorShape::zero()
    }

    /// Per-axis maximum of two paddings; used when several consumers request
    /// padded output from the same producer.
    pub fn max(&self, other: &Padding) -> Padding {
        Padding { lower: self.lower.max(&other.lower), upper: self.upper.max(&other.upper) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_axis_access() {
        let mut s = TensorShape::new(2, 3, 4, 5);
        assert_eq!(s.count(), 120);
        assert_eq!(s.get(Axis::Feature), 3);
        s.set(Axis::X, 7);
        assert_eq!(s.x, 7);
    }

    #[test]
    fn padding_max_is_per_axis() {
        let a = Padding::new(TensorShape::new(0, 0, 1, 2), TensorShape::new(0, 0, 1, 2));
        let b = Padding::new(TensorShape::new(0, 0, 2, 0), TensorShape::new(0, 0, 2, 0));
        let m = a.max(&b);
        assert_eq!(m.lower, TensorShape::new(0, 0, 2, 2));
        assert_eq!(m.upper, TensorShape::new(0, 0, 2, 2));
    }
}
