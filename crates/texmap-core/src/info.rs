//! Tensor descriptors: element type, shape, byte strides and layout.
//!
//! A [`TensorInfo`] carries no device resource, so it is a plain value that
//! every tensor and image plane can copy or share freely.
//!
//! Strides are expressed in **bytes**, outermost dimension first.  When no
//! strides are supplied the descriptor is dense row-major:
//! `stride[last] = dtype.size_bytes()`, `stride[i] = stride[i + 1] * shape[i + 1]`.

use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::error::{MemError, Result};

/// Inline capacity for shape/stride vectors (covers NCHW plus batch/time).
const INLINE_DIMS: usize = 6;

/// Shape or stride storage.
pub type Dims = SmallVec<[usize; INLINE_DIMS]>;

// ─── Element type ────────────────────────────────────────────────────────────

/// Element data type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    I64,
    F16,
    Bf16,
    F32,
    F64,
}

impl DType {
    pub const ALL: [DType; 11] = [
        DType::U8,
        DType::I8,
        DType::U16,
        DType::I16,
        DType::U32,
        DType::I32,
        DType::I64,
        DType::F16,
        DType::Bf16,
        DType::F32,
        DType::F64,
    ];

    /// Bytes per element.
    #[inline]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 | Self::F16 | Self::Bf16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|d| d.name() == lower)
            .ok_or_else(|| MemError::InvalidArgument(format!("unknown dtype '{s}'")))
    }
}

// ─── Layout ──────────────────────────────────────────────────────────────────

/// Semantic dimension order of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layout {
    /// No particular interpretation.
    Any,
    NC,
    CHW,
    HWC,
    NCHW,
    NHWC,
}

impl Layout {
    /// Best-effort guess from a shape.  Channel dimensions are assumed to be
    /// at most 4 wide (gray, RGB, RGBA/BGRX).
    pub fn guess(shape: &[usize]) -> Self {
        let is_channels = |c: usize| (1..=4).contains(&c);
        match *shape {
            [_, c, _, _] if is_channels(c) => Self::NCHW,
            [_, _, _, c] if is_channels(c) => Self::NHWC,
            [c, _, _] if is_channels(c) => Self::CHW,
            [_, _, c] if is_channels(c) => Self::HWC,
            [_, _] => Self::NC,
            _ => Self::Any,
        }
    }

    /// Rank this layout requires, `None` for [`Layout::Any`].
    pub const fn rank(self) -> Option<usize> {
        match self {
            Self::Any => None,
            Self::NC => Some(2),
            Self::CHW | Self::HWC => Some(3),
            Self::NCHW | Self::NHWC => Some(4),
        }
    }
}

// ─── TensorInfo ──────────────────────────────────────────────────────────────

/// Immutable shape/stride/dtype descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorInfo {
    shape: Dims,
    stride: Dims,
    dtype: DType,
    layout: Layout,
    nbytes: usize,
}

impl TensorInfo {
    /// Dense row-major descriptor.
    pub fn new(shape: &[usize], dtype: DType) -> Result<Self> {
        validate_shape(shape)?;
        let stride = default_strides(shape, dtype)?;
        let nbytes = span_bytes(shape, &stride, dtype)?;
        Ok(Self {
            shape: shape.iter().copied().collect(),
            stride,
            dtype,
            layout: Layout::guess(shape),
            nbytes,
        })
    }

    /// Descriptor with explicit byte strides (outermost first).
    ///
    /// Every stride must be at least one element wide; zero (broadcast)
    /// strides are rejected.
    pub fn with_strides(shape: &[usize], dtype: DType, strides: &[usize]) -> Result<Self> {
        validate_shape(shape)?;
        if strides.len() != shape.len() {
            return Err(MemError::InvalidArgument(format!(
                "stride rank {} does not match shape rank {}",
                strides.len(),
                shape.len()
            )));
        }
        if let Some(pos) = strides.iter().position(|&s| s < dtype.size_bytes()) {
            return Err(MemError::InvalidArgument(format!(
                "stride[{pos}]={} is smaller than one {dtype} element",
                strides[pos]
            )));
        }
        let nbytes = span_bytes(shape, strides, dtype)?;
        Ok(Self {
            shape: shape.iter().copied().collect(),
            stride: strides.iter().copied().collect(),
            dtype,
            layout: Layout::guess(shape),
            nbytes,
        })
    }

    /// Override the guessed layout.
    pub fn with_layout(mut self, layout: Layout) -> Result<Self> {
        if let Some(rank) = layout.rank()
            && rank != self.rank()
        {
            return Err(MemError::InvalidArgument(format!(
                "layout {layout:?} needs rank {rank}, tensor has rank {}",
                self.rank()
            )));
        }
        self.layout = layout;
        Ok(self)
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Byte strides, outermost first.
    #[inline]
    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes from the first element to the end of the last one, interior
    /// padding included.  Holds for any stride order.
    #[inline]
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Whether strides equal the dense row-major strides for this shape.
    pub fn is_contiguous(&self) -> bool {
        default_strides(&self.shape, self.dtype)
            .map(|s| s == self.stride)
            .unwrap_or(false)
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:?} stride={:?} {:?}",
            self.dtype,
            self.shape.as_slice(),
            self.stride.as_slice(),
            self.layout
        )
    }
}

fn validate_shape(shape: &[usize]) -> Result<()> {
    if shape.is_empty() {
        return Err(MemError::InvalidArgument("shape must have rank >= 1".into()));
    }
    if let Some(pos) = shape.iter().position(|&d| d == 0) {
        return Err(MemError::InvalidArgument(format!(
            "shape {shape:?} has zero-sized dimension {pos}"
        )));
    }
    Ok(())
}

/// `sum((shape[i] - 1) * stride[i]) + element size`: one past the byte
/// offset of the last element.
fn span_bytes(shape: &[usize], strides: &[usize], dtype: DType) -> Result<usize> {
    shape
        .iter()
        .zip(strides)
        .try_fold(dtype.size_bytes(), |acc, (&dim, &stride)| {
            (dim - 1)
                .checked_mul(stride)
                .and_then(|reach| acc.checked_add(reach))
        })
        .ok_or_else(|| {
            MemError::InvalidArgument(format!(
                "shape {shape:?} with strides {strides:?} overflows usize"
            ))
        })
}

/// Dense row-major byte strides for `shape`.
pub fn default_strides(shape: &[usize], dtype: DType) -> Result<Dims> {
    let mut strides: Dims = SmallVec::from_elem(0, shape.len());
    let mut acc = dtype.size_bytes();
    for (i, &dim) in shape.iter().enumerate().rev() {
        strides[i] = acc;
        acc = acc.checked_mul(dim).ok_or_else(|| {
            MemError::InvalidArgument(format!("shape {shape:?} overflows usize byte size"))
        })?;
    }
    Ok(strides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn default_strides_are_row_major_bytes() {
        let info = TensorInfo::new(&[1, 3, 224, 224], DType::F32).unwrap();
        assert_eq!(info.stride(), &[3 * 224 * 224 * 4, 224 * 224 * 4, 224 * 4, 4]);
        assert_eq!(info.nbytes(), 3 * 224 * 224 * 4);
        assert_eq!(info.size(), 3 * 224 * 224);
        assert_eq!(info.layout(), Layout::NCHW);
        assert!(info.is_contiguous());
    }

    #[test]
    fn interior_row_padding_counts_in_nbytes() {
        let info = TensorInfo::with_strides(&[480, 640], DType::U8, &[704, 1]).unwrap();
        assert_eq!(info.nbytes(), 479 * 704 + 640);
        assert!(!info.is_contiguous());
    }

    #[test]
    fn nbytes_holds_for_any_stride_order() {
        let transposed = TensorInfo::with_strides(&[3, 3], DType::U8, &[4, 3]).unwrap();
        assert_eq!(transposed.nbytes(), 15);
        let column_major = TensorInfo::with_strides(&[2, 5], DType::F32, &[4, 8]).unwrap();
        assert_eq!(column_major.nbytes(), 4 + 4 * 8 + 4);
        assert!(!column_major.is_contiguous());
        let err = TensorInfo::with_strides(&[2, 2], DType::U8, &[usize::MAX, 1]).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        let err = TensorInfo::new(&[], DType::U8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = TensorInfo::new(&[2, 0, 3], DType::U8).unwrap_err();
        assert!(err.to_string().contains("zero-sized"));
        let err = TensorInfo::with_strides(&[2, 3], DType::F32, &[12]).unwrap_err();
        assert!(err.to_string().contains("rank"));
        let err = TensorInfo::with_strides(&[2, 3], DType::F32, &[12, 2]).unwrap_err();
        assert!(err.to_string().contains("smaller than one f32"));
        assert!(TensorInfo::new(&[usize::MAX, 2], DType::F64).is_err());
    }

    #[test]
    fn layout_guess_and_override() {
        assert_eq!(Layout::guess(&[480, 640, 3]), Layout::HWC);
        assert_eq!(Layout::guess(&[3, 480, 640]), Layout::CHW);
        assert_eq!(Layout::guess(&[1, 480, 640, 4]), Layout::NHWC);
        assert_eq!(Layout::guess(&[8, 1000]), Layout::NC);
        assert_eq!(Layout::guess(&[5]), Layout::Any);

        let info = TensorInfo::new(&[2, 2, 2], DType::U8).unwrap();
        assert!(info.clone().with_layout(Layout::NCHW).is_err());
        assert_eq!(info.with_layout(Layout::HWC).unwrap().layout(), Layout::HWC);
    }

    #[test]
    fn dtype_names_round_trip() {
        for d in DType::ALL {
            assert_eq!(d.to_string().parse::<DType>().unwrap(), d);
        }
        assert!("complex64".parse::<DType>().is_err());
    }
}
