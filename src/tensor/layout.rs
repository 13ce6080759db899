use serde::{Deserialize, Serialize};

use crate::errors::{OxError, OxResult};
use crate::tensor::{Axis, Padding, TensorShape};
use crate::types::DataType;

/// Physical arrangement of a tensor's axes in memory, including blocking.
///
/// Data formats describe activations and network IO; weights formats
/// describe filter tensors, with OFM on the batch axis and IFM on the
/// feature axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    // data
    Bfyx,
    Yxfb,
    Byxf,
    Fyxb,
    /// 2-D data blocked 8x8 over batch and x, used by fully connected.
    BsXsXsv8Bsv8,
    /// 2-D data with batch blocked by 16.
    BsXBsv16,
    // weights
    Oiyx,
    Yxio,
    Ioyx,
    /// Weights with OFM blocked by 16.
    OsIyxOsv16,
}

impl Format {
    /// Axis permutation from outermost to innermost. Blocked formats report
    /// their conceptual ordering; their physical indexing is special-cased.
    pub fn order(&self) -> [Axis; 4] {
        use Axis::*;
        match self {
            Format::Bfyx | Format::Oiyx | Format::OsIyxOsv16 => [Batch, Feature, Y, X],
            Format::Yxfb | Format::Yxio => [Y, X, Feature, Batch],
            Format::Byxf => [Batch, Y, X, Feature],
            Format::Fyxb => [Feature, Y, X, Batch],
            Format::Ioyx => [Feature, Batch, Y, X],
            Format::BsXsXsv8Bsv8 | Format::BsXBsv16 => [Feature, Y, Batch, X],
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Format::Bfyx => "bfyx",
            Format::Yxfb => "yxfb",
            Format::Byxf => "byxf",
            Format::Fyxb => "fyxb",
            Format::BsXsXsv8Bsv8 => "bs_xs_xsv8_bsv8",
            Format::BsXBsv16 => "bs_x_bsv16",
            Format::Oiyx => "oiyx",
            Format::Yxio => "yxio",
            Format::Ioyx => "ioyx",
            Format::OsIyxOsv16 => "os_iyx_osv16",
        }
    }

    pub fn is_weights(&self) -> bool {
        matches!(self, Format::Oiyx | Format::Yxio | Format::Ioyx | Format::OsIyxOsv16)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Format::BsXsXsv8Bsv8 | Format::BsXBsv16 | Format::OsIyxOsv16)
    }

    /// Canonical permutations for which a single pitch product per axis
    /// fully describes element addressing.
    pub fn is_simple(&self) -> bool {
        !self.is_blocked()
    }

    /// Position of the named axis in this format's ordering, outermost
    /// first, or `None` when the format does not address that axis
    /// individually (blocked axes).
    pub fn channel_index(&self, axis: Axis) -> Option<usize> {
        if self.is_blocked() && matches!(axis, Axis::Batch | Axis::X) {
            return None;
        }
        self.order().iter().position(|a| *a == axis)
    }
}

/// Per-axis stride to the next element, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pitches {
    pub batch: usize,
    pub feature: usize,
    pub y: usize,
    pub x: usize,
}

impl Pitches {
    pub fn get(&self, axis: Axis) -> usize {
        match axis {
            Axis::Batch => self.batch,
            Axis::Feature => self.feature,
            Axis::Y => self.y,
            Axis::X => self.x,
        }
    }
}

fn round_up(value: usize, step: usize) -> usize {
    value.div_ceil(step) * step
}

/// Full description of a tensor in memory: element type, physical format,
/// logical size and the padding surrounding the logical region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub data_type: DataType,
    pub format: Format,
    pub size: TensorShape,
    pub padding: Padding,
}

impl Layout {
    pub fn new(data_type: DataType, format: Format, size: TensorShape) -> Self {
        Self { data_type, format, size, padding: Padding::zero() }
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Logical size plus padding along each axis.
    pub fn padded_size(&self) -> TensorShape {
        self.size.add(&self.padding.lower).add(&self.padding.upper)
    }

    pub fn logical_size(&self) -> usize {
        self.size.count()
    }

    /// Total addressable elements, including padding and blocking round-up.
    pub fn physical_size(&self) -> usize {
        let p = self.padded_size();
        match self.format {
            Format::OsIyxOsv16 => round_up(p.batch, 16) * p.feature * p.y * p.x,
            Format::BsXsXsv8Bsv8 => round_up(p.batch, 8) * round_up(p.x, 8) * p.feature * p.y,
            Format::BsXBsv16 => round_up(p.batch, 16) * p.feature * p.y * p.x,
            _ => p.count(),
        }
    }

    pub fn bytes(&self) -> usize {
        self.physical_size() * self.data_type.size()
    }

    /// Per-axis element strides. Innermost axis of a simple format has
    /// pitch 1; each outer pitch is the product of the padded sizes of the
    /// axes inside it. Meaningless for blocked formats, which are addressed
    /// through `element_offset` directly.
    pub fn pitches(&self) -> Pitches {
        let padded = self.padded_size();
        let order = self.format.order();
        let mut pitches = Pitches { batch: 0, feature: 0, y: 0, x: 0 };
        let mut stride = 1usize;
        for axis in order.iter().rev() {
            let v = match axis {
                Axis::Batch => {
                    pitches.batch = stride;
                    padded.batch
                }
                Axis::Feature => {
                    pitches.feature = stride;
                    padded.feature
                }
                Axis::Y => {
                    pitches.y = stride;
                    padded.y
                }
                Axis::X => {
                    pitches.x = stride;
                    padded.x
                }
            };
            stride *= v;
        }
        pitches
    }

    /// Linear element index of logical position (b, f, y, x). Lower padding
    /// is applied per axis before the pitch products.
    pub fn element_offset(&self, b: usize, f: usize, y: usize, x: usize) -> usize {
        let pb = b + self.padding.lower.batch;
        let pf = f + self.padding.lower.feature;
        let py = y + self.padding.lower.y;
        let px = x + self.padding.lower.x;
        match self.format {
            Format::OsIyxOsv16 => {
                let padded = self.padded_size();
                ((pb / 16) * padded.feature * padded.y * padded.x
                    + pf * padded.y * padded.x
                    + py * padded.x
                    + px)
                    * 16
                    + pb % 16
            }
            Format::BsXsXsv8Bsv8 => {
                let xs = round_up(self.padded_size().x, 8);
                ((pb / 8) * (xs / 8) + px / 8) * 64 + (px % 8) * 8 + pb % 8
            }
            Format::BsXBsv16 => {
                let padded = self.padded_size();
                ((pb / 16) * padded.x + px) * 16 + pb % 16
            }
            _ => {
                let pitches = self.pitches();
                pb * pitches.batch + pf * pitches.feature + py * pitches.y + px * pitches.x
            }
        }
    }

    /// Offset of logical element (0, 0, 0, 0); the base every kernel adds
    /// to its pitch arithmetic.
    pub fn base_offset(&self) -> usize {
        self.element_offset(0, 0, 0, 0)
    }

    /// Equivalent layout in the target format. Padding is not carried over;
    /// callers that need padded output request it explicitly afterwards.
    pub fn transform(&self, target: Format) -> Layout {
        Layout::new(self.data_type, target, self.size)
    }

    pub fn simple(&self) -> bool {
        self.format.is_simple()
    }

    /// True when two layouts describe bit-compatible memory, as required
    /// when binding caller memory to a network input.
    pub fn compatible(&self, other: &Layout) -> bool {
        self.data_type == other.data_type
            && self.format == other.format
            && self.size == other.size
            && self.padding == other.padding
    }

    pub fn expect_simple(&self, context: &str) -> OxResult<()> {
        if self.simple() {
            Ok(())
        } else {
            Err(OxError::UnsupportedLayout(format!(
                "{context}: format {} is not a simple permutation",
                self.format.tag()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bfyx_pitches() {
        let l = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(2, 3, 4, 5));
        let p = l.pitches();
        assert_eq!(p.x, 1);
        assert_eq!(p.y, 5);
        assert_eq!(p.feature, 20);
        assert_eq!(p.batch, 60);
        assert_eq!(l.physical_size(), 120);
        assert_eq!(l.element_offset(1, 2, 3, 4), 60 + 40 + 15 + 4);
    }

    #[test]
    fn yxfb_pitches() {
        let l = Layout::new(DataType::F32, Format::Yxfb, TensorShape::new(2, 3, 4, 5));
        let p = l.pitches();
        assert_eq!(p.batch, 1);
        assert_eq!(p.feature, 2);
        assert_eq!(p.x, 6);
        assert_eq!(p.y, 30);
    }

    #[test]
    fn padding_shifts_offsets() {
        let l = Layout::new(DataType::F32, Format::Bfyx, TensorShape::new(1, 1, 2, 2))
            .with_padding(Padding::spatial(1, 1));
        // padded row length is 4; logical (0,0) sits one row down, one in
        assert_eq!(l.element_offset(0, 0, 0, 0), 4 + 1);
        assert_eq!(l.physical_size(), 16);
        // every logical index stays inside the physical extent
        for y in 0..2 {
            for x in 0..2 {
                assert!(l.element_offset(0, 0, y, x) < l.physical_size());
            }
        }
    }

    #[test]
    fn pitch_monotonicity_invariant() {
        for format in [Format::Bfyx, Format::Yxfb, Format::Byxf, Format::Fyxb] {
            let l = Layout::new(DataType::F32, format, TensorShape::new(2, 3, 4, 5))
                .with_padding(Padding::spatial(1, 2));
            let padded = l.padded_size();
            let p = l.pitches();
            let order = format.order();
            for w in order.windows(2) {
                let outer = p.get(w[0]);
                let inner = p.get(w[1]);
                assert!(outer >= inner * padded.get(w[1]));
            }
        }
    }

    #[test]
    fn blocked_weights_offsets_stay_in_bounds() {
        let l = Layout::new(DataType::F32, Format::OsIyxOsv16, TensorShape::new(20, 3, 3, 3));
        assert_eq!(l.physical_size(), 32 * 3 * 3 * 3);
        let mut seen = std::collections::HashSet::new();
        for o in 0..20 {
            for i in 0..3 {
                for y in 0..3 {
                    for x in 0..3 {
                        let off = l.element_offset(o, i, y, x);
                        assert!(off < l.physical_size());
                        assert!(seen.insert(off), "aliasing at {o},{i},{y},{x}");
                    }
                }
            }
        }
    }

    #[test]
    fn bs_xs_blocked_is_a_bijection() {
        let l = Layout::new(DataType::F32, Format::BsXsXsv8Bsv8, TensorShape::new(10, 1, 1, 12));
        assert_eq!(l.physical_size(), 16 * 16);
        let mut seen = std::collections::HashSet::new();
        for b in 0..10 {
            for x in 0..12 {
                let off = l.element_offset(b, 0, 0, x);
                assert!(off < l.physical_size());
                assert!(seen.insert(off));
            }
        }
    }

    #[test]
    fn channel_index_reports_ordering() {
        assert_eq!(Format::Bfyx.channel_index(Axis::Feature), Some(1));
        assert_eq!(Format::Yxfb.channel_index(Axis::Batch), Some(3));
        assert_eq!(Format::BsXsXsv8Bsv8.channel_index(Axis::Batch), None);
    }
}
