//! Software device: a [`DeviceContext`] whose "device textures" live in
//! host RAM it allocates and tracks itself.
//!
//! Images it produces are tagged [`MemoryType::SoftDevice`], so the same
//! domain rules apply as for a real GPU: consumers must map them before
//! reading.  The context behaves like an asynchronous device:
//!
//! - `copy_to_staging` marks the copy as in flight;
//! - `lock_staging` fails while a copy is in flight, so callers that skip
//!   `synchronize` are caught;
//! - copies only accept images whose surface handle names a live texture
//!   allocated by this device.
//!
//! One-shot fault injection ([`SoftDevice::inject_fault`]) makes any device
//! operation fail once, to exercise error propagation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;
use tracing::debug;

use super::{DeviceContext, StagingDesc, StagingLock};
use crate::error::{MemError, Result};
use crate::image::{Image, MAX_PLANES, PixelFormat, PlaneLayout};
use crate::tensor::{DataPtr, HandleKind, MemoryType, NativeHandle};

/// Default row-pitch alignment for textures and staging surfaces.
pub const DEFAULT_PITCH_ALIGNMENT: usize = 64;

/// Device operation that [`SoftDevice::inject_fault`] can make fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOp {
    CreateStaging = 1,
    Copy = 2,
    Lock = 4,
    Unlock = 8,
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftDeviceStats {
    pub staging_created: u64,
    pub staging_live: usize,
    pub textures_live: usize,
    pub copies: u64,
    pub syncs: u64,
}

#[derive(Default)]
struct Shared {
    /// Live textures: surface id → (base address, length).
    surfaces: Mutex<HashMap<u64, (usize, usize)>>,
    next_surface: AtomicU64,
    staging_created: AtomicU64,
    staging_live: AtomicUsize,
    copies: AtomicU64,
    syncs: AtomicU64,
    in_flight: AtomicUsize,
    faults: AtomicU8,
}

impl Shared {
    fn take_fault(&self, op: FaultOp) -> bool {
        let bit = op as u8;
        self.faults.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }
}

/// Software-emulated device context.
pub struct SoftDevice {
    pitch_alignment: usize,
    shared: Arc<Shared>,
}

impl SoftDevice {
    /// `pitch_alignment` must be a power of two.
    pub fn new(pitch_alignment: usize) -> Result<Self> {
        if !pitch_alignment.is_power_of_two() {
            return Err(MemError::InvalidArgument(format!(
                "pitch alignment {pitch_alignment} is not a power of two"
            )));
        }
        Ok(Self {
            pitch_alignment,
            shared: Arc::new(Shared::default()),
        })
    }

    #[inline]
    pub fn pitch_alignment(&self) -> usize {
        self.pitch_alignment
    }

    /// Allocate a device texture.
    pub fn alloc_texture(&self, format: PixelFormat, width: u32, height: u32) -> Result<SoftTexture> {
        let (planes, total) = format.packed_layout(width, height, self.pitch_alignment)?;
        let mut buf = zeroed_buffer("alloc_texture", total)?;
        let data = DataPtr::new(buf.as_mut_ptr()).ok_or(MemError::NullPointer("soft texture"))?;
        let id = self.shared.next_surface.fetch_add(1, Ordering::Relaxed) + 1;
        let mut image = Image::new(MemoryType::SoftDevice, format, width, height, data, &planes)?;
        image.set_handle(HandleKind::Surface, NativeHandle(id));
        self.shared
            .surfaces
            .lock()
            .map_err(|_| MemError::device("alloc_texture", "surface registry poisoned"))?
            .insert(id, (data.addr() as usize, total));
        debug!(id, %format, width, height, bytes = total, "soft texture allocated");
        Ok(SoftTexture {
            id,
            buf,
            image,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Make the next call of `op` fail with a device failure.
    pub fn inject_fault(&self, op: FaultOp) {
        self.shared.faults.fetch_or(op as u8, Ordering::AcqRel);
    }

    pub fn stats(&self) -> SoftDeviceStats {
        let s = &self.shared;
        SoftDeviceStats {
            staging_created: s.staging_created.load(Ordering::Relaxed),
            staging_live: s.staging_live.load(Ordering::Relaxed),
            textures_live: s.surfaces.lock().map(|m| m.len()).unwrap_or(0),
            copies: s.copies.load(Ordering::Relaxed),
            syncs: s.syncs.load(Ordering::Relaxed),
        }
    }

    fn check_fault(&self, op: FaultOp, name: &'static str) -> Result<()> {
        if self.shared.take_fault(op) {
            return Err(MemError::device(name, "injected fault"));
        }
        Ok(())
    }
}

/// Zero-filled buffer; allocation failure is a device failure, not an abort.
fn zeroed_buffer(op: &'static str, len: usize) -> Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| MemError::device(op, format!("cannot allocate {len} bytes: {e}")))?;
    buf.resize(len, 0u8);
    Ok(buf.into_boxed_slice())
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self {
            pitch_alignment: DEFAULT_PITCH_ALIGNMENT,
            shared: Arc::new(Shared::default()),
        }
    }
}

// ─── Texture ─────────────────────────────────────────────────────────────────

/// Owning soft-device texture.  Freed (and unregistered) on drop.
pub struct SoftTexture {
    id: u64,
    buf: Box<[u8]>,
    image: Image,
    shared: Arc<Shared>,
}

impl SoftTexture {
    /// Non-owning view of this texture.
    #[inline]
    pub fn image(&self) -> &Image {
        &self.image
    }

    #[inline]
    pub fn surface_id(&self) -> u64 {
        self.id
    }

    /// Device-side write access (the emulated equivalent of a kernel or
    /// decoder writing the texture).
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Fill every row of `plane` with `f(row, col_byte)`.
    pub fn fill_plane(&mut self, plane: usize, mut f: impl FnMut(usize, usize) -> u8) -> Result<()> {
        let layout = self.image.plane(plane)?;
        let (_, rows) = self
            .image
            .format()
            .plane_dims(plane, self.image.width(), self.image.height());
        let row_bytes = self.image.format().min_row_bytes(plane, self.image.width());
        for r in 0..rows as usize {
            let start = layout.offset + r * layout.stride;
            for (c, byte) in self.buf[start..start + row_bytes].iter_mut().enumerate() {
                *byte = f(r, c);
            }
        }
        Ok(())
    }
}

impl Drop for SoftTexture {
    fn drop(&mut self) {
        if let Ok(mut surfaces) = self.shared.surfaces.lock() {
            surfaces.remove(&self.id);
        }
    }
}

// ─── Staging ─────────────────────────────────────────────────────────────────

/// Host-readable staging surface of a [`SoftDevice`].
pub struct SoftStaging {
    desc: StagingDesc,
    buf: Box<[u8]>,
    planes: SmallVec<[PlaneLayout; MAX_PLANES]>,
    locked: bool,
    shared: Arc<Shared>,
}

impl SoftStaging {
    #[inline]
    pub fn desc(&self) -> &StagingDesc {
        &self.desc
    }
}

impl Drop for SoftStaging {
    fn drop(&mut self) {
        self.shared.staging_live.fetch_sub(1, Ordering::Relaxed);
    }
}

// SAFETY: locks point into the staging's own boxed buffer, laid out by
// `packed_layout` for the staging descriptor and freed only on drop.
unsafe impl DeviceContext for SoftDevice {
    type Staging = SoftStaging;

    fn memory_type(&self) -> MemoryType {
        MemoryType::SoftDevice
    }

    fn create_staging(&self, desc: &StagingDesc) -> Result<SoftStaging> {
        self.check_fault(FaultOp::CreateStaging, "create_staging")?;
        let alignment = self.pitch_alignment.max(desc.pitch_alignment);
        let (planes, total) = desc
            .format
            .packed_layout(desc.width, desc.height, alignment)?;
        let buf = zeroed_buffer("create_staging", total)?;
        self.shared.staging_created.fetch_add(1, Ordering::Relaxed);
        self.shared.staging_live.fetch_add(1, Ordering::Relaxed);
        Ok(SoftStaging {
            desc: *desc,
            buf,
            planes: planes.into_iter().collect(),
            locked: false,
            shared: Arc::clone(&self.shared),
        })
    }

    fn staging_bytes(&self, staging: &SoftStaging) -> usize {
        staging.buf.len()
    }

    fn copy_to_staging(&self, src: &Image, dst: &mut SoftStaging) -> Result<()> {
        if src.memory_type() != MemoryType::SoftDevice {
            return Err(MemError::DomainMismatch {
                expected: MemoryType::SoftDevice,
                actual: src.memory_type(),
            });
        }
        if dst.desc.format != src.format() {
            return Err(MemError::FormatMismatch {
                expected: dst.desc.format,
                actual: src.format(),
            });
        }
        if !dst.desc.covers(&StagingDesc::of(src)) {
            return Err(MemError::InvalidArgument(format!(
                "staging {:?} cannot hold {} {}x{}",
                dst.desc,
                src.format(),
                src.width(),
                src.height()
            )));
        }
        if dst.locked {
            return Err(MemError::device("copy_to_staging", "destination is locked"));
        }
        self.check_fault(FaultOp::Copy, "copy_to_staging")?;

        // Holding the registry lock keeps the source texture alive for the
        // duration of the copy.
        let surfaces = self
            .shared
            .surfaces
            .lock()
            .map_err(|_| MemError::device("copy_to_staging", "surface registry poisoned"))?;
        let id = src
            .handle(HandleKind::Surface)
            .ok_or_else(|| MemError::device("copy_to_staging", "source has no surface handle"))?;
        let &(base, len) = surfaces.get(&id.0).ok_or_else(|| {
            MemError::device("copy_to_staging", format!("surface {} is not live", id.0))
        })?;
        let src_base = src.data().addr() as usize;
        let in_surface = src_base >= base
            && src_base
                .checked_add(src.byte_size())
                .is_some_and(|end| end <= base + len);
        if !in_surface {
            return Err(MemError::device(
                "copy_to_staging",
                format!("image range exceeds surface {}", id.0),
            ));
        }

        let format = src.format();
        for (plane, (s, d)) in src.planes().iter().zip(&dst.planes).enumerate() {
            let (_, rows) = format.plane_dims(plane, src.width(), src.height());
            let row_bytes = format.min_row_bytes(plane, src.width());
            for r in 0..rows as usize {
                let from = src_base + s.offset + r * s.stride;
                let to = d.offset + r * d.stride;
                // SAFETY: `from..from + row_bytes` lies inside the live
                // surface checked above; the destination range lies inside
                // the staging buffer laid out for at least these dimensions.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        from as *const u8,
                        dst.buf[to..to + row_bytes].as_mut_ptr(),
                        row_bytes,
                    );
                }
            }
        }
        drop(surfaces);

        self.shared.copies.fetch_add(1, Ordering::Relaxed);
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.shared.in_flight.store(0, Ordering::Release);
        self.shared.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn lock_staging(&self, staging: &mut SoftStaging) -> Result<StagingLock> {
        if self.shared.in_flight.load(Ordering::Acquire) > 0 {
            return Err(MemError::device(
                "lock_staging",
                "copy still in flight; synchronize first",
            ));
        }
        if staging.locked {
            return Err(MemError::device("lock_staging", "staging already locked"));
        }
        self.check_fault(FaultOp::Lock, "lock_staging")?;
        let data = DataPtr::new(staging.buf.as_mut_ptr())
            .ok_or(MemError::NullPointer("soft staging"))?;
        staging.locked = true;
        Ok(StagingLock {
            data,
            planes: staging.planes.clone(),
        })
    }

    fn unlock_staging(&self, staging: &mut SoftStaging) -> Result<()> {
        if !staging.locked {
            return Err(MemError::device("unlock_staging", "staging is not locked"));
        }
        staging.locked = false;
        self.check_fault(FaultOp::Unlock, "unlock_staging")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn textures_register_and_unregister() {
        let dev = SoftDevice::default();
        let tex = dev.alloc_texture(PixelFormat::Nv12, 64, 32).unwrap();
        assert_eq!(tex.image().memory_type(), MemoryType::SoftDevice);
        assert_eq!(
            tex.image().handle(HandleKind::Surface),
            Some(NativeHandle(tex.surface_id()))
        );
        assert_eq!(dev.stats().textures_live, 1);
        drop(tex);
        assert_eq!(dev.stats().textures_live, 0);
    }

    #[test]
    fn lock_requires_synchronize_after_copy() {
        let dev = SoftDevice::default();
        let mut tex = dev.alloc_texture(PixelFormat::Bgrx, 16, 4).unwrap();
        tex.fill_plane(0, |r, c| (r * 16 + c) as u8).unwrap();
        let mut staging = dev.create_staging(&StagingDesc::of(tex.image())).unwrap();

        dev.copy_to_staging(tex.image(), &mut staging).unwrap();
        let err = dev.lock_staging(&mut staging).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFailure);

        dev.synchronize().unwrap();
        let lock = dev.lock_staging(&mut staging).unwrap();
        // SAFETY: staging is locked and owned by this test.
        let row1 = unsafe {
            std::slice::from_raw_parts(
                lock.data.offset(lock.planes[0].stride).unwrap().as_ptr().cast::<u8>(),
                64,
            )
        };
        assert_eq!(row1[0], 16);
        assert_eq!(row1[5], 21);
        dev.unlock_staging(&mut staging).unwrap();
        assert!(dev.unlock_staging(&mut staging).is_err());
    }

    #[test]
    fn copy_rejects_dead_surfaces() {
        let dev = SoftDevice::default();
        let tex = dev.alloc_texture(PixelFormat::Bgr, 8, 8).unwrap();
        let image = tex.image().clone();
        let mut staging = dev.create_staging(&StagingDesc::of(&image)).unwrap();
        drop(tex);
        let err = dev.copy_to_staging(&image, &mut staging).unwrap_err();
        assert!(err.to_string().contains("not live"));
    }

    #[test]
    fn copy_into_staging_of_another_format_is_format_mismatch() {
        let dev = SoftDevice::default();
        let tex = dev.alloc_texture(PixelFormat::Nv12, 32, 32).unwrap();
        let mut staging = dev
            .create_staging(&StagingDesc {
                format: PixelFormat::Bgrx,
                width: 64,
                height: 64,
                pitch_alignment: 1,
            })
            .unwrap();
        let err = dev.copy_to_staging(tex.image(), &mut staging).unwrap_err();
        assert!(matches!(
            err,
            MemError::FormatMismatch {
                expected: PixelFormat::Bgrx,
                actual: PixelFormat::Nv12
            }
        ));
        assert_eq!(err.error_code(), 104);
        assert_eq!(dev.stats().copies, 0);
    }

    #[test]
    fn oversized_textures_are_invalid_arguments() {
        let dev = SoftDevice::default();
        let err = dev
            .alloc_texture(PixelFormat::Bgrx, u32::MAX, u32::MAX)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = dev
            .create_staging(&StagingDesc {
                format: PixelFormat::I420,
                width: u32::MAX,
                height: u32::MAX,
                pitch_alignment: 1,
            })
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(dev.stats().textures_live, 0);
        assert_eq!(dev.stats().staging_live, 0);
    }

    #[test]
    fn injected_faults_fire_once() {
        let dev = SoftDevice::default();
        let desc = StagingDesc {
            format: PixelFormat::Rgba,
            width: 4,
            height: 4,
            pitch_alignment: 1,
        };
        dev.inject_fault(FaultOp::CreateStaging);
        assert!(dev.create_staging(&desc).is_err());
        let staging = dev.create_staging(&desc).unwrap();
        assert_eq!(dev.stats().staging_created, 1);
        assert_eq!(dev.stats().staging_live, 1);
        dev.release_staging(staging);
        assert_eq!(dev.stats().staging_live, 0);
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        assert!(SoftDevice::new(48).is_err());
        assert_eq!(SoftDevice::new(256).unwrap().pitch_alignment(), 256);
    }
}
