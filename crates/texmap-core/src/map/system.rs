//! Device → host mapping through a reusable staging surface.
//!
//! `map` runs, in order:
//!
//! 1. reject a second map while mapped;
//! 2. check the image is in the context's domain;
//! 3. check the plane count against the count cached from earlier maps;
//! 4. reuse the staging surface, or release it and allocate a new one;
//! 5. copy, fence, lock;
//! 6. wrap the locked staging as a host [`Image`].
//!
//! `unmap` unlocks the staging surface but keeps it for the next map.  It is
//! freed when the mapper is dropped or reconfigured, or when a new image no
//! longer fits.

use std::sync::Arc;

use tracing::{debug, warn};

use super::ImageMap;
use crate::config::{MapperConfig, StagingPolicy};
use crate::device::{DeviceContext, StagingDesc};
use crate::error::{MemError, Result};
use crate::image::Image;
use crate::readback_audit;
use crate::stats::StagingStats;
use crate::tensor::MemoryType;

struct StagingSlot<S> {
    resource: S,
    desc: StagingDesc,
    bytes: usize,
}

/// Reads device images back into host memory.
pub struct SystemMemoryMap<D: DeviceContext> {
    ctx: Arc<D>,
    config: MapperConfig,
    stats: Arc<StagingStats>,
    staging: Option<StagingSlot<D::Staging>>,
    num_planes: Option<usize>,
    mapped: bool,
}

impl<D: DeviceContext> SystemMemoryMap<D> {
    pub fn new(ctx: Arc<D>) -> Self {
        Self {
            ctx,
            config: MapperConfig::default(),
            stats: Arc::new(StagingStats::new()),
            staging: None,
            num_planes: None,
            mapped: false,
        }
    }

    pub fn with_config(ctx: Arc<D>, config: MapperConfig) -> Result<Self> {
        config.validate()?;
        let mut map = Self::new(ctx);
        map.config = config;
        Ok(map)
    }

    /// Share staging counters with other mappers.
    pub fn with_stats(mut self, stats: Arc<StagingStats>) -> Self {
        self.stats = stats;
        self
    }

    #[inline]
    pub fn context(&self) -> &Arc<D> {
        &self.ctx
    }

    #[inline]
    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &Arc<StagingStats> {
        &self.stats
    }

    /// Plane count cached from the first successful map.
    #[inline]
    pub fn cached_planes(&self) -> Option<usize> {
        self.num_planes
    }

    /// Shape of the current staging surface, if one is allocated.
    pub fn staging_desc(&self) -> Option<StagingDesc> {
        self.staging.as_ref().map(|s| s.desc)
    }

    /// Replace the configuration, free the staging surface and forget the
    /// cached plane count.  Fails while mapped.
    pub fn reconfigure(&mut self, config: MapperConfig) -> Result<()> {
        if self.mapped {
            return Err(MemError::InvalidState(
                "cannot reconfigure while an image is mapped".into(),
            ));
        }
        config.validate()?;
        self.release_staging();
        self.num_planes = None;
        self.config = config;
        debug!(policy = ?self.config.staging_policy, "mapper reconfigured");
        Ok(())
    }

    fn acquire_staging(&mut self, want: &StagingDesc) -> Result<()> {
        let mut alloc_desc = *want;
        if let Some(slot) = &self.staging {
            let reusable = match self.config.staging_policy {
                StagingPolicy::GrowOnly => slot.desc.covers(want),
                StagingPolicy::ExactMatch => slot.desc.same_extent(want),
            };
            if reusable {
                self.stats.on_reuse();
                debug!(format = %want.format, width = want.width, height = want.height, "staging reused");
                return Ok(());
            }
            if self.config.staging_policy == StagingPolicy::GrowOnly
                && slot.desc.format == want.format
            {
                alloc_desc.width = alloc_desc.width.max(slot.desc.width);
                alloc_desc.height = alloc_desc.height.max(slot.desc.height);
            }
            self.release_staging();
        }

        let resource = self.ctx.create_staging(&alloc_desc)?;
        let bytes = self.ctx.staging_bytes(&resource);
        self.stats.on_alloc(bytes);
        debug!(
            format = %alloc_desc.format,
            width = alloc_desc.width,
            height = alloc_desc.height,
            bytes,
            "staging allocated"
        );
        self.staging = Some(StagingSlot {
            resource,
            desc: alloc_desc,
            bytes,
        });
        Ok(())
    }

    fn release_staging(&mut self) {
        if let Some(slot) = self.staging.take() {
            self.ctx.release_staging(slot.resource);
            self.stats.on_release(slot.bytes);
            debug!(bytes = slot.bytes, "staging released");
        }
    }
}

impl<D: DeviceContext> ImageMap for SystemMemoryMap<D> {
    fn map(&mut self, image: &Image) -> Result<Image> {
        if self.mapped {
            return Err(MemError::InvalidState(
                "image already mapped; unmap first".into(),
            ));
        }
        let domain = self.ctx.memory_type();
        if image.memory_type() != domain {
            return Err(MemError::DomainMismatch {
                expected: domain,
                actual: image.memory_type(),
            });
        }
        if let Some(expected) = self.num_planes
            && expected != image.num_planes()
        {
            return Err(MemError::PlaneCountMismatch {
                expected,
                actual: image.num_planes(),
            });
        }

        self.acquire_staging(&StagingDesc::aligned(image, self.config.pitch_alignment))?;
        let Some(slot) = self.staging.as_mut() else {
            return Err(MemError::InvalidState("staging missing after acquire".into()));
        };

        readback_audit::record_readback("SystemMemoryMap::map", image.byte_size());

        self.ctx.copy_to_staging(image, &mut slot.resource)?;
        self.stats.on_copy();
        self.ctx.synchronize()?;
        let lock = self.ctx.lock_staging(&mut slot.resource)?;

        let host = match Image::new(
            MemoryType::Host,
            image.format(),
            image.width(),
            image.height(),
            lock.data,
            &lock.planes,
        ) {
            Ok(host) => host,
            Err(err) => {
                if let Err(unlock_err) = self.ctx.unlock_staging(&mut slot.resource) {
                    warn!(error = %unlock_err, "unlock after failed map");
                }
                return Err(err);
            }
        };

        self.num_planes = Some(image.num_planes());
        self.mapped = true;
        debug!(
            format = %image.format(),
            width = image.width(),
            height = image.height(),
            "mapped to host"
        );
        Ok(host)
    }

    fn unmap(&mut self) {
        if !self.mapped {
            return;
        }
        self.mapped = false;
        let Some(slot) = self.staging.as_mut() else {
            return;
        };
        if let Err(err) = self.ctx.unlock_staging(&mut slot.resource) {
            warn!(error = %err, "unlock_staging failed during unmap; discarding staging");
            self.release_staging();
        } else {
            debug!("unmapped");
        }
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn target_memory_type(&self) -> MemoryType {
        MemoryType::Host
    }
}

impl<D: DeviceContext> Drop for SystemMemoryMap<D> {
    fn drop(&mut self) {
        self.unmap();
        self.release_staging();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::soft::{FaultOp, SoftDevice};
    use crate::error::ErrorKind;
    use crate::image::PixelFormat;

    fn setup(format: PixelFormat, w: u32, h: u32) -> (Arc<SoftDevice>, crate::device::soft::SoftTexture) {
        let dev = Arc::new(SoftDevice::default());
        let tex = dev.alloc_texture(format, w, h).unwrap();
        (dev, tex)
    }

    #[test]
    fn copies_pixels_to_host() {
        let (dev, mut tex) = setup(PixelFormat::Nv12, 16, 8);
        tex.fill_plane(0, |r, c| (r * 16 + c) as u8).unwrap();
        tex.fill_plane(1, |r, c| 200 + (r + c) as u8).unwrap();
        let mut map = SystemMemoryMap::new(dev.clone());
        let host = map.map(tex.image()).unwrap();
        assert_eq!(host.memory_type(), MemoryType::Host);
        // SAFETY: mapped until `unmap` below.
        let (y, uv) = unsafe { (host.plane_bytes(0).unwrap(), host.plane_bytes(1).unwrap()) };
        let stride = host.plane(0).unwrap().stride;
        assert_eq!(y[stride * 3 + 5], 53);
        assert_eq!(uv[host.plane(1).unwrap().stride + 2], 203);
        map.unmap();
        assert_eq!(dev.stats().copies, 1);
        assert_eq!(dev.stats().syncs, 1);
    }

    #[test]
    fn grow_only_reuses_smaller_images() {
        let (dev, big) = setup(PixelFormat::Bgrx, 64, 64);
        let small = dev.alloc_texture(PixelFormat::Bgrx, 32, 16).unwrap();
        let mut map = SystemMemoryMap::new(dev.clone());
        map.map(big.image()).unwrap();
        map.unmap();
        let host = map.map(small.image()).unwrap();
        assert_eq!((host.width(), host.height()), (32, 16));
        map.unmap();
        assert_eq!(dev.stats().staging_created, 1);
        assert_eq!(map.stats().snapshot().reuses, 1);
    }

    #[test]
    fn growing_releases_old_staging_first() {
        let (dev, small) = setup(PixelFormat::Bgrx, 32, 64);
        let wide = dev.alloc_texture(PixelFormat::Bgrx, 64, 16).unwrap();
        let mut map = SystemMemoryMap::new(dev.clone());
        map.map(small.image()).unwrap();
        map.unmap();
        map.map(wide.image()).unwrap();
        map.unmap();
        let desc = map.staging_desc().unwrap();
        assert_eq!((desc.width, desc.height), (64, 64));
        assert_eq!(dev.stats().staging_created, 2);
        assert_eq!(dev.stats().staging_live, 1);
        assert_eq!(map.stats().snapshot().releases, 1);
    }

    #[test]
    fn exact_match_reallocates_on_any_change() {
        let (dev, big) = setup(PixelFormat::Rgba, 64, 64);
        let small = dev.alloc_texture(PixelFormat::Rgba, 32, 32).unwrap();
        let config = MapperConfig {
            staging_policy: StagingPolicy::ExactMatch,
            ..MapperConfig::default()
        };
        let mut map = SystemMemoryMap::with_config(dev.clone(), config).unwrap();
        map.map(big.image()).unwrap();
        map.unmap();
        map.map(small.image()).unwrap();
        map.unmap();
        assert_eq!(dev.stats().staging_created, 2);
    }

    #[test]
    fn plane_count_is_cached_until_reconfigure() {
        let (dev, nv12) = setup(PixelFormat::Nv12, 32, 32);
        let bgrx = dev.alloc_texture(PixelFormat::Bgrx, 32, 32).unwrap();
        let mut map = SystemMemoryMap::new(dev.clone());
        map.map(nv12.image()).unwrap();
        map.unmap();
        let err = map.map(bgrx.image()).unwrap_err();
        assert!(matches!(
            err,
            MemError::PlaneCountMismatch {
                expected: 2,
                actual: 1
            }
        ));
        assert!(!map.is_mapped());

        map.reconfigure(MapperConfig::default()).unwrap();
        assert_eq!(map.cached_planes(), None);
        assert_eq!(dev.stats().staging_live, 0);
        map.map(bgrx.image()).unwrap();
        assert!(map.reconfigure(MapperConfig::default()).is_err());
        map.unmap();
    }

    #[test]
    fn device_failures_leave_mapper_unmapped() {
        let (dev, tex) = setup(PixelFormat::I420, 16, 16);
        let mut map = SystemMemoryMap::new(dev.clone());
        for op in [FaultOp::CreateStaging, FaultOp::Copy, FaultOp::Lock] {
            dev.inject_fault(op);
            let err = map.map(tex.image()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DeviceFailure);
            assert!(!map.is_mapped());
            map.unmap();
        }
        map.map(tex.image()).unwrap();
        map.unmap();
    }

    #[test]
    fn unlock_failure_is_logged_and_staging_discarded() {
        let (dev, tex) = setup(PixelFormat::Bgr, 8, 8);
        let mut map = SystemMemoryMap::new(dev.clone());
        map.map(tex.image()).unwrap();
        dev.inject_fault(FaultOp::Unlock);
        map.unmap();
        assert!(!map.is_mapped());
        assert!(map.staging_desc().is_none());
        map.map(tex.image()).unwrap();
        map.unmap();
        assert_eq!(dev.stats().staging_created, 2);
    }

    #[test]
    fn domain_is_checked() {
        let dev = Arc::new(SoftDevice::default());
        let mut map = SystemMemoryMap::new(dev);
        let buf = vec![0u8; 64];
        let (planes, _) = PixelFormat::Rgba.packed_layout(4, 4, 1).unwrap();
        let host = Image::new(
            MemoryType::Host,
            PixelFormat::Rgba,
            4,
            4,
            crate::tensor::DataPtr::new(buf.as_ptr().cast_mut()).unwrap(),
            &planes,
        )
        .unwrap();
        let err = map.map(&host).unwrap_err();
        assert!(matches!(err, MemError::DomainMismatch { .. }));
    }

    #[cfg(feature = "audit-readback")]
    #[test]
    fn readbacks_are_flagged_only_inside_device_only_regions() {
        let (dev, tex) = setup(PixelFormat::Nv12, 16, 16);
        let mut map = SystemMemoryMap::new(dev);
        let before = readback_audit::readback_count();
        map.map(tex.image()).unwrap();
        map.unmap();
        assert!(readback_audit::readback_count() > before);

        let region = readback_audit::device_only("inference");
        map.map(tex.image()).unwrap();
        map.unmap();
        assert_eq!(region.violations(), 1);
    }

    #[test]
    fn drop_releases_staging() {
        let (dev, tex) = setup(PixelFormat::Nv12, 16, 16);
        {
            let mut map = SystemMemoryMap::new(dev.clone());
            map.map(tex.image()).unwrap();
            assert_eq!(dev.stats().staging_live, 1);
        }
        assert_eq!(dev.stats().staging_live, 0);
    }
}
