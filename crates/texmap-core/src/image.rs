//! Multi-plane pixel images and pixel-format contracts.
//!
//! An [`Image`] is a lightweight, cloneable *handle*: it never owns the
//! memory it points at.  Owning allocations (device textures, staging
//! surfaces) live in backends and hand out `Image` views.
//!
//! # Invariants
//!
//! 1. `num_planes() == format().plane_count()`.
//! 2. For every plane `i`, `stride(i) >= format().min_row_bytes(i, width)`.
//! 3. `data()` is never null.  Plane `i` starts at `data() + offset(i)`.
//! 4. `byte_size()` fits in `usize`, and so does `data() + byte_size()`.

use std::fmt;
use std::str::FromStr;

use crate::error::{MemError, Result};
use crate::info::{DType, TensorInfo};
use crate::tensor::{
    DataPtr, DeviceTensor, HandleKind, HandleTable, HostTensor, MemoryType, NativeHandle, Tensor,
};

/// Upper bound on planes for any supported format.
pub const MAX_PLANES: usize = 4;

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Pixel format of an [`Image`].
///
/// Every variant documents its plane layout so that staging allocation is
/// deterministic.  Chroma dimensions round up for odd sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Y plane `w × h` (1 B/px) + interleaved UV plane `w/2 × h/2` (2 B/px).
    Nv12,
    /// Y plane `w × h` + U plane `w/2 × h/2` + V plane `w/2 × h/2`, 1 B/px each.
    I420,
    /// Packed 4 B/px, alpha ignored.
    Bgrx,
    /// Packed 4 B/px.
    Bgra,
    /// Packed 4 B/px, alpha ignored.
    Rgbx,
    /// Packed 4 B/px.
    Rgba,
    /// Packed 3 B/px.
    Bgr,
    /// Three full-resolution planes R, G, B (1 B/px each).
    Rgbp,
    /// Three full-resolution planes B, G, R (1 B/px each).
    Bgrp,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 9] = [
        Self::Nv12,
        Self::I420,
        Self::Bgrx,
        Self::Bgra,
        Self::Rgbx,
        Self::Rgba,
        Self::Bgr,
        Self::Rgbp,
        Self::Bgrp,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Nv12 => "nv12",
            Self::I420 => "i420",
            Self::Bgrx => "bgrx",
            Self::Bgra => "bgra",
            Self::Rgbx => "rgbx",
            Self::Rgba => "rgba",
            Self::Bgr => "bgr",
            Self::Rgbp => "rgbp",
            Self::Bgrp => "bgrp",
        }
    }

    #[inline]
    pub const fn plane_count(self) -> usize {
        match self {
            Self::Nv12 => 2,
            Self::I420 | Self::Rgbp | Self::Bgrp => 3,
            Self::Bgrx | Self::Bgra | Self::Rgbx | Self::Rgba | Self::Bgr => 1,
        }
    }

    /// Interleaved channels stored per pixel of `plane`.
    #[inline]
    pub const fn plane_channels(self, plane: usize) -> usize {
        match self {
            Self::Nv12 if plane == 1 => 2,
            Self::Nv12 | Self::I420 | Self::Rgbp | Self::Bgrp => 1,
            Self::Bgrx | Self::Bgra | Self::Rgbx | Self::Rgba => 4,
            Self::Bgr => 3,
        }
    }

    /// Bytes per pixel of `plane` (all supported formats are 8-bit).
    #[inline]
    pub const fn plane_bytes_per_pixel(self, plane: usize) -> usize {
        self.plane_channels(plane)
    }

    /// Whether `plane` is 2×2 chroma sub-sampled.
    #[inline]
    const fn is_subsampled(self, plane: usize) -> bool {
        matches!(self, Self::Nv12 | Self::I420) && plane > 0
    }

    /// `(width, height)` of `plane` in pixels.
    #[inline]
    pub const fn plane_dims(self, plane: usize, width: u32, height: u32) -> (u32, u32) {
        if self.is_subsampled(plane) {
            (width.div_ceil(2), height.div_ceil(2))
        } else {
            (width, height)
        }
    }

    /// Minimum row pitch of `plane` in bytes, saturating at `usize::MAX`.
    #[inline]
    pub const fn min_row_bytes(self, plane: usize, width: u32) -> usize {
        let (w, _) = self.plane_dims(plane, width, 1);
        (w as usize).saturating_mul(self.plane_bytes_per_pixel(plane))
    }

    /// Plane layout for a freshly allocated, back-to-back image whose row
    /// pitches are rounded up to `pitch_alignment` (a power of two).
    ///
    /// Returns the planes and the total allocation size in bytes.
    pub fn packed_layout(
        self,
        width: u32,
        height: u32,
        pitch_alignment: usize,
    ) -> Result<(Vec<PlaneLayout>, usize)> {
        if width == 0 || height == 0 {
            return Err(MemError::InvalidArgument(format!(
                "image dimensions {width}x{height} must be non-zero"
            )));
        }
        if !pitch_alignment.is_power_of_two() {
            return Err(MemError::InvalidArgument(format!(
                "pitch alignment {pitch_alignment} is not a power of two"
            )));
        }
        let overflow = || {
            MemError::InvalidArgument(format!(
                "{self} image {width}x{height} at pitch alignment {pitch_alignment} overflows usize"
            ))
        };
        let mut planes = Vec::with_capacity(self.plane_count());
        let mut offset = 0usize;
        for plane in 0..self.plane_count() {
            let (cols, rows) = self.plane_dims(plane, width, height);
            let stride = (cols as usize)
                .checked_mul(self.plane_bytes_per_pixel(plane))
                .and_then(|row| align_up(row, pitch_alignment))
                .ok_or_else(overflow)?;
            planes.push(PlaneLayout { offset, stride });
            offset = stride
                .checked_mul(rows as usize)
                .and_then(|bytes| offset.checked_add(bytes))
                .ok_or_else(overflow)?;
        }
        Ok((planes, offset))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.name() == lower)
            .ok_or_else(|| MemError::InvalidArgument(format!("unknown pixel format '{s}'")))
    }
}

#[inline]
const fn align_up(value: usize, alignment: usize) -> Option<usize> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

// ─── Plane layout ────────────────────────────────────────────────────────────

/// Placement of one plane relative to the image base address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PlaneLayout {
    /// Byte offset from [`Image::data`].
    pub offset: usize,
    /// Row pitch in bytes.
    pub stride: usize,
}

// ─── Image ───────────────────────────────────────────────────────────────────

/// Non-owning handle to multi-plane pixel data in some memory domain.
#[derive(Clone, Debug)]
pub struct Image {
    memory_type: MemoryType,
    format: PixelFormat,
    width: u32,
    height: u32,
    data: DataPtr,
    planes: [PlaneLayout; MAX_PLANES],
    num_planes: usize,
    byte_size: usize,
    handles: HandleTable,
}

impl Image {
    /// Validate and build an image handle.
    ///
    /// Fails with an argument error when the plane count or any stride is
    /// inconsistent with `format`, when the dimensions are zero, or when the
    /// planes extend past the end of the address space.
    pub fn new(
        memory_type: MemoryType,
        format: PixelFormat,
        width: u32,
        height: u32,
        data: DataPtr,
        planes: &[PlaneLayout],
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(MemError::InvalidArgument(format!(
                "image dimensions {width}x{height} must be non-zero"
            )));
        }
        if planes.len() != format.plane_count() {
            return Err(MemError::PlaneCountMismatch {
                expected: format.plane_count(),
                actual: planes.len(),
            });
        }
        let mut byte_size = 0usize;
        for (i, plane) in planes.iter().enumerate() {
            let min = format.min_row_bytes(i, width);
            if plane.stride < min {
                return Err(MemError::InvalidArgument(format!(
                    "{format} plane {i} stride {} is below the {min}-byte row of a {width}px image",
                    plane.stride
                )));
            }
            let (_, rows) = format.plane_dims(i, width, height);
            let end = plane
                .stride
                .checked_mul(rows as usize)
                .and_then(|bytes| plane.offset.checked_add(bytes))
                .filter(|&end| data.addr().checked_add(end as u64).is_some())
                .ok_or_else(|| {
                    MemError::InvalidArgument(format!(
                        "{format} plane {i} at offset {} with stride {} overflows the address space",
                        plane.offset, plane.stride
                    ))
                })?;
            byte_size = byte_size.max(end);
        }
        let mut table = [PlaneLayout::default(); MAX_PLANES];
        table[..planes.len()].copy_from_slice(planes);
        Ok(Self {
            memory_type,
            format,
            width,
            height,
            data,
            planes: table,
            num_planes: planes.len(),
            byte_size,
            handles: HandleTable::default(),
        })
    }

    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Primary data address (start of the allocation holding plane 0).
    #[inline]
    pub fn data(&self) -> DataPtr {
        self.data
    }

    #[inline]
    pub fn num_planes(&self) -> usize {
        self.num_planes
    }

    #[inline]
    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes[..self.num_planes]
    }

    pub fn plane(&self, plane: usize) -> Result<PlaneLayout> {
        self.planes().get(plane).copied().ok_or_else(|| {
            MemError::InvalidArgument(format!(
                "plane {plane} out of range for {} ({} planes)",
                self.format, self.num_planes
            ))
        })
    }

    /// Address of the first byte of `plane`.
    pub fn plane_ptr(&self, plane: usize) -> Result<DataPtr> {
        let offset = self.plane(plane)?.offset;
        self.data.offset(offset).ok_or_else(|| {
            MemError::InvalidArgument(format!(
                "plane {plane} offset {offset} overflows base address {:#x}",
                self.data.addr()
            ))
        })
    }

    /// Bytes from `data()` to the end of the last row of the last plane.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    #[inline]
    pub fn handle(&self, kind: HandleKind) -> Option<NativeHandle> {
        self.handles.get(kind)
    }

    #[inline]
    pub fn set_handle(&mut self, kind: HandleKind, value: NativeHandle) -> Option<NativeHandle> {
        self.handles.set(kind, value)
    }

    /// `[rows, cols, channels]` u8 descriptor of one plane, using the
    /// plane's row pitch as the outer stride.
    pub fn plane_info(&self, plane: usize) -> Result<TensorInfo> {
        let layout = self.plane(plane)?;
        let (cols, rows) = self.format.plane_dims(plane, self.width, self.height);
        let channels = self.format.plane_channels(plane);
        TensorInfo::with_strides(
            &[rows as usize, cols as usize, channels],
            DType::U8,
            &[layout.stride, channels, 1],
        )
    }

    /// Host bytes of `plane` (`stride × rows`).
    ///
    /// # Safety
    ///
    /// The memory behind this image must still be valid, e.g. the mapping
    /// that produced it has not been unmapped yet.
    pub unsafe fn plane_bytes(&self, plane: usize) -> Result<&[u8]> {
        self.require_host()?;
        let layout = self.plane(plane)?;
        let (_, rows) = self.format.plane_dims(plane, self.width, self.height);
        let ptr = self.plane_ptr(plane)?.as_ptr().cast::<u8>();
        // SAFETY: caller guarantees the image memory is live; plane extents
        // were validated against the format at construction.
        Ok(unsafe { std::slice::from_raw_parts(ptr, layout.stride * rows as usize) })
    }

    /// Tensor view of one plane in the image's own domain.
    ///
    /// Host images yield a [`HostTensor`], device images a [`DeviceTensor`]
    /// carrying the plane offset and the image's surface handle.
    ///
    /// # Safety
    ///
    /// Same as [`Image::plane_bytes`]: the returned tensor must not outlive
    /// the memory behind this image.
    pub unsafe fn plane_tensor(&self, plane: usize) -> Result<Box<dyn Tensor>> {
        let info = self.plane_info(plane)?;
        let ptr = self.plane_ptr(plane)?;
        let mut tensor: Box<dyn Tensor> = if self.memory_type.is_host_accessible() {
            // SAFETY: forwarded from the caller's contract.
            Box::new(unsafe { HostTensor::from_raw(info, ptr.as_ptr())? })
        } else {
            Box::new(DeviceTensor::new(self.memory_type, info, ptr.addr())?)
        };
        tensor.set_handle(
            HandleKind::Offset,
            NativeHandle(self.plane(plane)?.offset as u64),
        );
        if let Some(surface) = self.handle(HandleKind::Surface) {
            tensor.set_handle(HandleKind::Surface, surface);
        }
        Ok(tensor)
    }

    fn require_host(&self) -> Result<()> {
        if self.memory_type.is_host_accessible() {
            Ok(())
        } else {
            Err(MemError::DomainMismatch {
                expected: MemoryType::Host,
                actual: self.memory_type,
            })
        }
    }
}
