//! Stub for builds without the `cuda-runtime` feature.
//!
//! Same public surface as the real backend; every constructor fails, so no
//! value of these types ever exists at runtime.

use std::fmt;
use std::sync::Arc;

use texmap_core::device::{DeviceContext, StagingDesc, StagingLock};
use texmap_core::error::{MemError, Result};
use texmap_core::image::{Image, PixelFormat};
use texmap_core::info::TensorInfo;
use texmap_core::tensor::{BaseTensor, MemoryType, Tensor};

fn unavailable(op: &'static str) -> MemError {
    MemError::device(
        op,
        "texmap-cuda built in stub mode: enable the `cuda-runtime` feature",
    )
}

pub struct CudaContext {
    _private: (),
}

impl CudaContext {
    pub fn new(ordinal: usize) -> Result<Arc<Self>> {
        let _ = ordinal;
        Err(unavailable("cuDeviceGet"))
    }

    pub fn ordinal(&self) -> usize {
        0
    }

    pub fn vram_usage(&self) -> (usize, usize) {
        (0, 0)
    }

    pub fn alloc_texture(
        self: &Arc<Self>,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<CudaTexture> {
        let _ = (format, width, height);
        Err(unavailable("cuMemAlloc"))
    }
}

pub struct CudaTexture {
    image: Image,
}

impl CudaTexture {
    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn upload(&mut self, bytes: &[u8]) -> Result<()> {
        let _ = bytes;
        Err(unavailable("cuMemcpyHtoD"))
    }
}

pub struct CudaStaging {
    _private: (),
}

// SAFETY: no stub constructor succeeds, so no lock is ever handed out.
unsafe impl DeviceContext for CudaContext {
    type Staging = CudaStaging;

    fn memory_type(&self) -> MemoryType {
        MemoryType::CudaDevice
    }

    fn create_staging(&self, desc: &StagingDesc) -> Result<CudaStaging> {
        let _ = desc;
        Err(unavailable("create_staging"))
    }

    fn staging_bytes(&self, _staging: &CudaStaging) -> usize {
        0
    }

    fn copy_to_staging(&self, src: &Image, dst: &mut CudaStaging) -> Result<()> {
        let _ = (src, dst);
        Err(unavailable("cuMemcpyDtoHAsync"))
    }

    fn synchronize(&self) -> Result<()> {
        Err(unavailable("cuCtxSynchronize"))
    }

    fn lock_staging(&self, staging: &mut CudaStaging) -> Result<StagingLock> {
        let _ = staging;
        Err(unavailable("lock_staging"))
    }

    fn unlock_staging(&self, staging: &mut CudaStaging) -> Result<()> {
        let _ = staging;
        Err(unavailable("unlock_staging"))
    }
}

pub struct CudaTensor {
    base: BaseTensor,
}

impl CudaTensor {
    pub fn zeroed(ctx: &Arc<CudaContext>, info: TensorInfo) -> Result<Self> {
        let _ = (ctx, info);
        Err(unavailable("cuMemAlloc"))
    }
}

impl fmt::Debug for CudaTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaTensor").field("info", self.base.info()).finish()
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
