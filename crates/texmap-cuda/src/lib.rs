#![doc = include_str!("../README.md")]

#[cfg(not(feature = "cuda-runtime"))]
#[path = "context_stub.rs"]
pub mod context;
#[cfg(feature = "cuda-runtime")]
pub mod context;

pub use context::{CudaContext, CudaStaging, CudaTensor, CudaTexture};

/// Row-pitch alignment of CUDA textures and staging buffers.
pub const DEFAULT_PITCH_ALIGNMENT: usize = 256;
