//! CUDA device context, device textures and owning device tensors.
//!
//! Device textures are pitched linear allocations.  Staging surfaces are host
//! buffers laid out with the same pitch rules, filled by per-plane
//! `cuMemcpyDtoHAsync` on the device's default stream.  `synchronize` is the
//! fence between the copy and host access.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, DriverError};
use tracing::{debug, info};

use texmap_core::device::{DeviceContext, StagingDesc, StagingLock};
use texmap_core::error::{MemError, Result};
use texmap_core::image::{Image, PixelFormat, PlaneLayout};
use texmap_core::info::TensorInfo;
use texmap_core::tensor::{BaseTensor, DataPtr, HandleKind, MemoryType, NativeHandle, Tensor};

use crate::DEFAULT_PITCH_ALIGNMENT;

fn driver(op: &'static str) -> impl FnOnce(DriverError) -> MemError {
    move |err| MemError::device(op, err.to_string())
}

// ─── Memory accounting ──────────────────────────────────────────────────────

/// Device bytes allocated through one context.
struct VramAccounting {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl VramAccounting {
    const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn on_alloc(&self, bytes: usize) {
        let prev = self.current.fetch_add(bytes, Ordering::Relaxed);
        self.peak.fetch_max(prev + bytes, Ordering::Relaxed);
    }

    #[inline]
    fn on_free(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::Relaxed);
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

pub struct CudaContext {
    device: Arc<CudaDevice>,
    ordinal: usize,
    pitch_alignment: usize,
    vram: VramAccounting,
    in_flight: AtomicUsize,
}

impl CudaContext {
    /// Open device `ordinal`.
    pub fn new(ordinal: usize) -> Result<Arc<Self>> {
        let device = CudaDevice::new(ordinal).map_err(driver("cuDeviceGet"))?;
        info!(
            ordinal,
            name = %device.name().unwrap_or_default(),
            "CUDA context created"
        );
        Ok(Arc::new(Self {
            device,
            ordinal,
            pitch_alignment: DEFAULT_PITCH_ALIGNMENT,
            vram: VramAccounting::new(),
            in_flight: AtomicUsize::new(0),
        }))
    }

    #[inline]
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    #[inline]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Current and peak device bytes allocated through this context.
    pub fn vram_usage(&self) -> (usize, usize) {
        (
            self.vram.current.load(Ordering::Relaxed),
            self.vram.peak.load(Ordering::Relaxed),
        )
    }

    /// Allocate a zeroed pitched texture.
    pub fn alloc_texture(
        self: &Arc<Self>,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<CudaTexture> {
        let (planes, total) = format.packed_layout(width, height, self.pitch_alignment)?;
        let buf = self
            .device
            .alloc_zeros::<u8>(total)
            .map_err(driver("cuMemAlloc"))?;
        self.vram.on_alloc(total);
        let ptr = DataPtr::from_addr(*buf.device_ptr())
            .ok_or(MemError::NullPointer("CUDA texture"))?;
        let mut image = Image::new(MemoryType::CudaDevice, format, width, height, ptr, &planes)?;
        image.set_handle(HandleKind::Device, NativeHandle(self.ordinal as u64));
        debug!(%format, width, height, bytes = total, "CUDA texture allocated");
        Ok(CudaTexture {
            ctx: Arc::clone(self),
            buf,
            image,
        })
    }
}

// ─── Texture ─────────────────────────────────────────────────────────────────

/// Owning pitched device texture.  Freed on drop.
pub struct CudaTexture {
    ctx: Arc<CudaContext>,
    buf: CudaSlice<u8>,
    image: Image,
}

impl CudaTexture {
    #[inline]
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Replace the whole allocation (every plane, padding included).
    pub fn upload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.buf.len() {
            return Err(MemError::InvalidArgument(format!(
                "upload of {} bytes into a {}-byte texture",
                bytes.len(),
                self.buf.len()
            )));
        }
        self.ctx
            .device
            .htod_sync_copy_into(bytes, &mut self.buf)
            .map_err(driver("cuMemcpyHtoD"))
    }
}

impl Drop for CudaTexture {
    fn drop(&mut self) {
        self.ctx.vram.on_free(self.buf.len());
    }
}

// ─── Staging ─────────────────────────────────────────────────────────────────

/// Host staging buffer for CUDA readback.
pub struct CudaStaging {
    desc: StagingDesc,
    buf: Box<[u8]>,
    planes: Vec<PlaneLayout>,
    locked: bool,
}

// SAFETY: locks point into the staging's own boxed host buffer, laid out by
// `packed_layout` for the staging descriptor and freed only on drop.
unsafe impl DeviceContext for CudaContext {
    type Staging = CudaStaging;

    fn memory_type(&self) -> MemoryType {
        MemoryType::CudaDevice
    }

    fn create_staging(&self, desc: &StagingDesc) -> Result<CudaStaging> {
        let alignment = self.pitch_alignment.max(desc.pitch_alignment);
        let (planes, total) = desc
            .format
            .packed_layout(desc.width, desc.height, alignment)?;
        Ok(CudaStaging {
            desc: *desc,
            buf: vec![0u8; total].into_boxed_slice(),
            planes,
            locked: false,
        })
    }

    fn staging_bytes(&self, staging: &CudaStaging) -> usize {
        staging.buf.len()
    }

    fn copy_to_staging(&self, src: &Image, dst: &mut CudaStaging) -> Result<()> {
        if src.memory_type() != MemoryType::CudaDevice {
            return Err(MemError::DomainMismatch {
                expected: MemoryType::CudaDevice,
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
        self.device
            .bind_to_thread()
            .map_err(driver("cuCtxSetCurrent"))?;
        let stream = *self.device.cu_stream();

        let format = src.format();
        for (plane, (s, d)) in src.planes().iter().zip(&dst.planes).enumerate() {
            let (_, rows) = format.plane_dims(plane, src.width(), src.height());
            let rows = rows as usize;
            let base = src.data().addr() + s.offset as u64;
            if s.stride == d.stride {
                let span = &mut dst.buf[d.offset..d.offset + s.stride * rows];
                // SAFETY: `base` covers `stride * rows` bytes of a live device
                // allocation per the image contract; `span` is owned by the
                // staging and not read before the fence.
                unsafe { cudarc::driver::result::memcpy_dtoh_async(span, base, stream) }
                    .map_err(driver("cuMemcpyDtoHAsync"))?;
            } else {
                let row_bytes = format.min_row_bytes(plane, src.width());
                for r in 0..rows {
                    let to = d.offset + r * d.stride;
                    let span = &mut dst.buf[to..to + row_bytes];
                    // SAFETY: as above, one row at a time.
                    unsafe {
                        cudarc::driver::result::memcpy_dtoh_async(
                            span,
                            base + (r * s.stride) as u64,
                            stream,
                        )
                    }
                    .map_err(driver("cuMemcpyDtoHAsync"))?;
                }
            }
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.device
            .synchronize()
            .map_err(driver("cuCtxSynchronize"))?;
        self.in_flight.store(0, Ordering::Release);
        Ok(())
    }

    fn lock_staging(&self, staging: &mut CudaStaging) -> Result<StagingLock> {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            return Err(MemError::device(
                "lock_staging",
                "copy still in flight; synchronize first",
            ));
        }
        if staging.locked {
            return Err(MemError::device("lock_staging", "staging already locked"));
        }
        let data = DataPtr::new(staging.buf.as_mut_ptr())
            .ok_or(MemError::NullPointer("CUDA staging"))?;
        staging.locked = true;
        Ok(StagingLock {
            data,
            planes: staging.planes.iter().copied().collect(),
        })
    }

    fn unlock_staging(&self, staging: &mut CudaStaging) -> Result<()> {
        if !staging.locked {
            return Err(MemError::device("unlock_staging", "staging is not locked"));
        }
        staging.locked = false;
        Ok(())
    }
}

// ─── Owning device tensor ────────────────────────────────────────────────────

/// Device tensor that allocated its own zeroed buffer.  Freed on drop.
pub struct CudaTensor {
    base: BaseTensor,
    ctx: Arc<CudaContext>,
    buf: CudaSlice<u8>,
}

impl CudaTensor {
    pub fn zeroed(ctx: &Arc<CudaContext>, info: TensorInfo) -> Result<Self> {
        let bytes = info.nbytes();
        let buf = ctx
            .device
            .alloc_zeros::<u8>(bytes)
            .map_err(driver("cuMemAlloc"))?;
        ctx.vram.on_alloc(bytes);
        let addr = *buf.device_ptr();
        let mut base = BaseTensor::new(
            MemoryType::CudaDevice,
            info,
            addr as usize as *mut c_void,
        )?;
        base.set_handle(HandleKind::Device, NativeHandle(ctx.ordinal as u64));
        Ok(Self {
            base,
            ctx: Arc::clone(ctx),
            buf,
        })
    }
}

impl fmt::Debug for CudaTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaTensor")
            .field("info", self.base.info())
            .field("data", &self.base.data())
            .field("ordinal", &self.ctx.ordinal)
            .finish()
    }
}

impl Tensor for CudaTensor {
    fn base(&self) -> &BaseTensor {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTensor {
        &mut self.base
    }

    fn is_owning(&self) -> bool {
        true
    }
}

impl Drop for CudaTensor {
    fn drop(&mut self) {
        self.ctx.vram.on_free(self.buf.len());
    }
}
