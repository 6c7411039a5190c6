#![doc = include_str!("../README.md")]

pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod info;
pub mod map;
pub mod readback_audit;
pub mod stats;
pub mod tensor;

pub use config::{MapperConfig, StagingPolicy};
pub use device::{DeviceContext, StagingDesc, StagingLock};
pub use error::{ErrorKind, MemError, Result};
pub use image::{Image, PixelFormat, PlaneLayout};
pub use info::{DType, Layout, TensorInfo};
pub use map::{ImageMap, ImageMapExt, MappedImage, PassthroughMap, SystemMemoryMap};
pub use tensor::{
    BaseTensor, DataPtr, DeviceTensor, HandleKind, HostTensor, MemoryType, NativeHandle,
    OwnedHostTensor, Tensor,
};
