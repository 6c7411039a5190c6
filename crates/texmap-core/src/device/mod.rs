//! Device context contract: the operations a memory domain must provide so
//! images living in it can be read back to the host.
//!
//! Contexts are created by whoever owns the device (pipeline, runtime) and
//! handed to mappers as `Arc<D>`.  Mappers use a context but never create or
//! destroy it.
//!
//! # Threading
//!
//! A context may be shared by many mappers on many threads.  Implementations
//! must serialize their own command submission as the underlying device API
//! requires; texmap adds no locking around context calls.

pub mod soft;

use smallvec::SmallVec;

use crate::error::Result;
use crate::image::{Image, MAX_PLANES, PixelFormat, PlaneLayout};
use crate::tensor::{DataPtr, MemoryType};

/// Shape of a staging surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StagingDesc {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Minimum row-pitch alignment requested by the mapper (power of two).
    /// Backends may align further.
    pub pitch_alignment: usize,
}

impl StagingDesc {
    /// Staging shape able to receive a copy of `image`, with byte-aligned rows.
    pub fn of(image: &Image) -> Self {
        Self::aligned(image, 1)
    }

    pub fn aligned(image: &Image, pitch_alignment: usize) -> Self {
        Self {
            format: image.format(),
            width: image.width(),
            height: image.height(),
            pitch_alignment,
        }
    }

    /// Whether a surface of this shape can receive a copy of `other`.
    #[inline]
    pub fn covers(&self, other: &StagingDesc) -> bool {
        self.format == other.format && self.width >= other.width && self.height >= other.height
    }

    /// Whether this shape has exactly `other`'s format and dimensions.
    #[inline]
    pub fn same_extent(&self, other: &StagingDesc) -> bool {
        self.format == other.format && self.width == other.width && self.height == other.height
    }
}

/// Host address and plane placement of a locked staging surface.
#[derive(Clone, Debug)]
pub struct StagingLock {
    /// Host-dereferenceable base address.
    pub data: DataPtr,
    /// Per-plane offsets from `data` and row pitches.
    pub planes: SmallVec<[PlaneLayout; MAX_PLANES]>,
}

/// Operations a device domain exposes for host readback.
///
/// # Safety
///
/// Host views of mapped images are read through safe code, so implementors
/// must guarantee that a [`StagingLock`] returned by
/// [`lock_staging`](Self::lock_staging) addresses host memory owned by the
/// staging resource, readable for `stride * rows` bytes of every plane of
/// the surface's [`StagingDesc`], until the matching
/// [`unlock_staging`](Self::unlock_staging) or until the resource is
/// released.
pub unsafe trait DeviceContext: Send + Sync {
    /// Host-readable staging resource owned by whoever created it.
    type Staging: Send;

    /// Domain whose images this context can copy from.
    fn memory_type(&self) -> MemoryType;

    /// Allocate a staging surface for `desc`.
    fn create_staging(&self, desc: &StagingDesc) -> Result<Self::Staging>;

    /// Bytes held by `staging`, for accounting.
    fn staging_bytes(&self, staging: &Self::Staging) -> usize;

    /// Copy `src` into `dst`.  May only enqueue the copy; callers must
    /// [`synchronize`](Self::synchronize) before touching `dst` on the host.
    fn copy_to_staging(&self, src: &Image, dst: &mut Self::Staging) -> Result<()>;

    /// Block until every copy previously issued through this context is done.
    fn synchronize(&self) -> Result<()>;

    /// Make `staging` host-addressable.
    fn lock_staging(&self, staging: &mut Self::Staging) -> Result<StagingLock>;

    /// Revoke host access granted by [`lock_staging`](Self::lock_staging).
    fn unlock_staging(&self, staging: &mut Self::Staging) -> Result<()>;

    /// Destroy a staging surface.
    fn release_staging(&self, staging: Self::Staging) {
        drop(staging);
    }
}
