//! Map/unmap protocol: obtain a view of an [`Image`] in another memory
//! domain, then release it.
//!
//! ```text
//! let host = mapper.map(&device_image)?;   // copy + fence + lock
//! ... read host planes ...
//! mapper.unmap();                          // unlock, staging kept for reuse
//! ```
//!
//! A mapper holds at most one live mapping.  Mapping again before `unmap`
//! fails with [`MemError::InvalidState`](crate::error::MemError::InvalidState).
//! `unmap` never fails and is a no-op when nothing is mapped.

pub mod passthrough;
pub mod system;

use std::ops::Deref;
use std::sync::Arc;

use crate::config::MapperConfig;
use crate::device::DeviceContext;
use crate::error::{MemError, Result};
use crate::image::Image;
use crate::tensor::MemoryType;

pub use passthrough::PassthroughMap;
pub use system::SystemMemoryMap;

/// Stateful mapper between two memory domains.
pub trait ImageMap: Send {
    /// Produce a view of `image` valid until [`unmap`](Self::unmap).
    fn map(&mut self, image: &Image) -> Result<Image>;

    /// Release the current mapping.  Never fails; no-op if nothing is mapped.
    fn unmap(&mut self);

    fn is_mapped(&self) -> bool;

    /// Domain of images returned by [`map`](Self::map).
    fn target_memory_type(&self) -> MemoryType;
}

/// Scoped mapping helpers available on every [`ImageMap`].
pub trait ImageMapExt: ImageMap {
    /// Map `image` and unmap automatically when the guard drops.
    fn map_scoped(&mut self, image: &Image) -> Result<MappedImage<'_, Self>> {
        let mapped = self.map(image)?;
        Ok(MappedImage {
            mapper: self,
            image: mapped,
        })
    }
}

impl<M: ImageMap + ?Sized> ImageMapExt for M {}

/// A live mapping.  Dereferences to the mapped [`Image`].
pub struct MappedImage<'a, M: ImageMap + ?Sized> {
    mapper: &'a mut M,
    image: Image,
}

impl<D: DeviceContext> MappedImage<'_, SystemMemoryMap<D>> {
    /// Host bytes of `plane`.  The borrow cannot outlive the mapping.
    ///
    /// Only staged readbacks get a safe accessor: their host memory belongs
    /// to the mapper's locked staging surface.  Other mappers hand back the
    /// caller's own image, readable through the unsafe
    /// [`Image::plane_bytes`].
    pub fn plane_bytes(&self, plane: usize) -> Result<&[u8]> {
        // SAFETY: the image was built by `SystemMemoryMap::map` over a
        // staging lock, which the `DeviceContext` contract keeps readable
        // until unmap.  The mapper is exclusively borrowed by this guard, so
        // unmap cannot run while the returned slice is alive.
        unsafe { self.image.plane_bytes(plane) }
    }
}

impl<M: ImageMap + ?Sized> Deref for MappedImage<'_, M> {
    type Target = Image;

    fn deref(&self) -> &Image {
        &self.image
    }
}

impl<M: ImageMap + ?Sized> Drop for MappedImage<'_, M> {
    fn drop(&mut self) {
        self.mapper.unmap();
    }
}

/// Mapper from `source` to `target` with the default configuration.
pub fn create_image_map<D>(
    source: MemoryType,
    target: MemoryType,
    ctx: Arc<D>,
) -> Result<Box<dyn ImageMap>>
where
    D: DeviceContext + 'static,
{
    create_image_map_with_config(source, target, ctx, MapperConfig::default())
}

/// Mapper from `source` to `target`.
///
/// Same domain → [`PassthroughMap`]; the context's domain to host →
/// [`SystemMemoryMap`].  Anything else is an argument error.
pub fn create_image_map_with_config<D>(
    source: MemoryType,
    target: MemoryType,
    ctx: Arc<D>,
    config: MapperConfig,
) -> Result<Box<dyn ImageMap>>
where
    D: DeviceContext + 'static,
{
    if source == target {
        return Ok(Box::new(PassthroughMap::new(source)));
    }
    if target == MemoryType::Host && source == ctx.memory_type() {
        return Ok(Box::new(SystemMemoryMap::with_config(ctx, config)?));
    }
    Err(MemError::InvalidArgument(format!(
        "no mapper from {source} to {target} (context domain is {})",
        ctx.memory_type()
    )))
}
