//! Same-domain mapping: no copy, no staging.

use tracing::debug;

use super::ImageMap;
use crate::error::{MemError, Result};
use crate::image::Image;
use crate::tensor::MemoryType;

/// Returns the source image itself.  Only tracks the mapped flag.
#[derive(Debug)]
pub struct PassthroughMap {
    memory_type: MemoryType,
    mapped: bool,
}

impl PassthroughMap {
    pub fn new(memory_type: MemoryType) -> Self {
        Self {
            memory_type,
            mapped: false,
        }
    }
}

impl ImageMap for PassthroughMap {
    fn map(&mut self, image: &Image) -> Result<Image> {
        if self.mapped {
            return Err(MemError::InvalidState(
                "image already mapped; unmap first".into(),
            ));
        }
        if image.memory_type() != self.memory_type {
            return Err(MemError::DomainMismatch {
                expected: self.memory_type,
                actual: image.memory_type(),
            });
        }
        self.mapped = true;
        debug!(domain = %self.memory_type, format = %image.format(), "pass-through map");
        Ok(image.clone())
    }

    fn unmap(&mut self) {
        self.mapped = false;
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn target_memory_type(&self) -> MemoryType {
        self.memory_type
    }
}
