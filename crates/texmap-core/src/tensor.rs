//! Memory-typed tensors.
//!
//! # Ownership model
//!
//! Ownership is part of the type, never a runtime flag:
//!
//! | Type | Domain | Owns memory |
//! |---|---|---|
//! | [`HostTensor`] | host | no, borrows caller memory |
//! | [`OwnedHostTensor`] | host | yes, freed on drop |
//! | [`DeviceTensor`] | any device | no, wraps a device address |
//!
//! Backends add their own owning device tensors (e.g. `texmap_cuda::CudaTensor`)
//! by implementing [`Tensor`] on top of a [`BaseTensor`].
//!
//! # Invariants
//!
//! 1. `memory_type` is fixed at construction.
//! 2. The primary data pointer is a first-class field, set at construction,
//!    and never null.  It cannot be replaced through the handle table.
//! 3. `data()` is only dereferenceable from host code when
//!    `memory_type().is_host_accessible()`.  For device domains it is an
//!    address meaningful to that device only.

use std::alloc::{self, Layout as AllocLayout};
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::str::FromStr;

use crate::error::{MemError, Result};
use crate::info::TensorInfo;

/// Alignment of self-allocated host buffers (one cache line pair; also
/// satisfies every [`DType`](crate::info::DType)).
pub const HOST_ALIGNMENT: usize = 128;

// ─── Memory domain ───────────────────────────────────────────────────────────

/// Physical location / addressing regime of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Host RAM, directly dereferenceable.
    Host,
    /// Software-emulated device textures (see [`crate::device::soft`]).
    SoftDevice,
    /// CUDA device memory.
    CudaDevice,
}

impl MemoryType {
    pub const ALL: [MemoryType; 3] = [Self::Host, Self::SoftDevice, Self::CudaDevice];

    /// Whether `data()` pointers in this domain may be dereferenced by the CPU.
    #[inline]
    pub const fn is_host_accessible(self) -> bool {
        matches!(self, Self::Host)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::SoftDevice => "soft",
            Self::CudaDevice => "cuda",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MemoryType {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.name() == lower)
            .ok_or_else(|| MemError::InvalidArgument(format!("unknown memory type '{s}'")))
    }
}

// ─── Primary data pointer ────────────────────────────────────────────────────

/// Non-null primary data address.
///
/// For host domains this is a dereferenceable pointer; for device domains it
/// is a device address carried as a pointer-sized integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataPtr(NonNull<c_void>);

// SAFETY: `DataPtr` is an address value.  Dereferencing it is gated by the
// owning tensor/image contracts, which are themselves Send + Sync.
unsafe impl Send for DataPtr {}
unsafe impl Sync for DataPtr {}

impl DataPtr {
    /// `None` if `ptr` is null.
    #[inline]
    pub fn new<T>(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr.cast::<c_void>()).map(Self)
    }

    /// Wrap a device address (e.g. a `CUdeviceptr`).
    #[inline]
    pub fn from_addr(addr: u64) -> Option<Self> {
        Self::new(addr as usize as *mut c_void)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    #[inline]
    pub fn addr(self) -> u64 {
        self.0.as_ptr() as usize as u64
    }

    /// Address advanced by `bytes`, or `None` if that passes the end of
    /// the address space.
    #[inline]
    pub fn offset(self, bytes: usize) -> Option<Self> {
        (self.0.as_ptr() as usize).checked_add(bytes)?;
        // Device addresses are never dereferenced here, so the advance is not
        // required to stay inside one allocation.
        NonNull::new(self.0.as_ptr().wrapping_byte_add(bytes)).map(Self)
    }
}

impl fmt::Debug for DataPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataPtr({:#x})", self.addr())
    }
}

// ─── Auxiliary handles ───────────────────────────────────────────────────────

/// Kinds of auxiliary native handles a tensor or image may carry.
///
/// The primary data pointer is deliberately absent: it lives in a dedicated
/// field and cannot be registered here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Byte offset of the data inside a larger allocation.
    Offset,
    /// Device surface / texture handle.
    Surface,
    /// Device handle.
    Device,
    /// Device context handle.
    Context,
    /// DMA-BUF file descriptor.
    DmaFd,
    /// DRM format modifier.
    DrmModifier,
}

impl HandleKind {
    pub const COUNT: usize = 6;

    #[inline]
    const fn slot(self) -> usize {
        self as usize
    }
}

/// Opaque native handle value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// Fixed-capacity handle table, one slot per [`HandleKind`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandleTable {
    slots: [Option<NativeHandle>; HandleKind::COUNT],
}

impl HandleTable {
    #[inline]
    pub fn get(&self, kind: HandleKind) -> Option<NativeHandle> {
        self.slots[kind.slot()]
    }

    /// Store a handle, returning the previous value for that kind.
    #[inline]
    pub fn set(&mut self, kind: HandleKind, value: NativeHandle) -> Option<NativeHandle> {
        self.slots[kind.slot()].replace(value)
    }

    #[inline]
    pub fn remove(&mut self, kind: HandleKind) -> Option<NativeHandle> {
        self.slots[kind.slot()].take()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── BaseTensor ──────────────────────────────────────────────────────────────

/// Bookkeeping shared by every tensor variant: descriptor, domain, primary
/// data pointer and auxiliary handles.
#[derive(Clone, Debug)]
pub struct BaseTensor {
    info: TensorInfo,
    memory_type: MemoryType,
    data: DataPtr,
    handles: HandleTable,
}

impl BaseTensor {
    /// Fails with an argument error if `data` is null.
    pub fn new<T>(memory_type: MemoryType, info: TensorInfo, data: *mut T) -> Result<Self> {
        let data = DataPtr::new(data).ok_or(MemError::NullPointer("tensor data"))?;
        Ok(Self {
            info,
            memory_type,
            data,
            handles: HandleTable::default(),
        })
    }

    #[inline]
    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    #[inline]
    pub fn data(&self) -> DataPtr {
        self.data
    }

    #[inline]
    pub fn handle(&self, kind: HandleKind) -> Option<NativeHandle> {
        self.handles.get(kind)
    }

    #[inline]
    pub fn set_handle(&mut self, kind: HandleKind, value: NativeHandle) -> Option<NativeHandle> {
        self.handles.set(kind, value)
    }

    #[inline]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }
}

// ─── Tensor trait ────────────────────────────────────────────────────────────

/// Polymorphic tensor handle over any memory domain.
pub trait Tensor: Send + Sync + fmt::Debug {
    fn base(&self) -> &BaseTensor;

    fn base_mut(&mut self) -> &mut BaseTensor;

    /// Whether dropping this tensor frees the memory behind `data()`.
    fn is_owning(&self) -> bool;

    fn info(&self) -> &TensorInfo {
        self.base().info()
    }

    fn memory_type(&self) -> MemoryType {
        self.base().memory_type()
    }

    /// Primary data address.  Stable for the tensor's lifetime.
    fn data(&self) -> DataPtr {
        self.base().data()
    }

    fn handle(&self, kind: HandleKind) -> Option<NativeHandle> {
        self.base().handle(kind)
    }

    fn set_handle(&mut self, kind: HandleKind, value: NativeHandle) -> Option<NativeHandle> {
        self.base_mut().set_handle(kind, value)
    }

    /// Host view of the tensor bytes (`info().nbytes()` long).
    ///
    /// Device-domain tensors return a domain mismatch; map them first.
    fn host_bytes(&self) -> Result<&[u8]> {
        Err(MemError::DomainMismatch {
            expected: MemoryType::Host,
            actual: self.memory_type(),
        })
    }
}

// ─── Host, borrowed ──────────────────────────────────────────────────────────

/// Host tensor over memory owned elsewhere.  Never frees.
#[derive(Debug)]
pub struct HostTensor<'a> {
    base: BaseTensor,
    _borrow: PhantomData<&'a [u8]>,
}

impl<'a> HostTensor<'a> {
    /// Borrow a byte slice; it must cover `info.nbytes()`.
    pub fn from_slice(info: TensorInfo, bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < info.nbytes() {
            return Err(MemError::InvalidArgument(format!(
                "buffer of {} bytes is smaller than tensor extent {}",
                bytes.len(),
                info.nbytes()
            )));
        }
        let ptr = bytes.as_ptr().cast_mut();
        Ok(Self {
            base: BaseTensor::new(MemoryType::Host, info, ptr)?,
            _borrow: PhantomData,
        })
    }
}

impl HostTensor<'static> {
    /// Wrap a raw host pointer handed over by a producer.
    ///
    /// Fails with an argument error if `ptr` is null.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `info.nbytes()` bytes for as long as
    /// the returned tensor (or any borrow of [`Tensor::host_bytes`]) is alive.
    pub unsafe fn from_raw<T>(info: TensorInfo, ptr: *mut T) -> Result<Self> {
        Ok(Self {
            base: BaseTensor::new(MemoryType::Host, info, ptr)?,
            _borrow: PhantomData,
        })
    }
}

impl Tensor for HostTensor<'_> {
    fn base(&self) -> &BaseTensor {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTensor {
        &mut self.base
    }

    fn is_owning(&self) -> bool {
        false
    }

    fn host_bytes(&self) -> Result<&[u8]> {
        // SAFETY: construction guarantees the pointer covers nbytes for the
        // tensor lifetime (slice borrow or `from_raw` contract).
        Ok(unsafe {
            std::slice::from_raw_parts(self.base.data().as_ptr().cast::<u8>(), self.info().nbytes())
        })
    }
}

// ─── Host, owning ────────────────────────────────────────────────────────────

/// Host tensor that allocated its own zero-initialized, aligned buffer.
/// The buffer is freed on drop and never reallocated.
#[derive(Debug)]
pub struct OwnedHostTensor {
    base: BaseTensor,
    layout: AllocLayout,
}

impl OwnedHostTensor {
    pub fn zeroed(info: TensorInfo) -> Result<Self> {
        let layout = AllocLayout::from_size_align(info.nbytes().max(1), HOST_ALIGNMENT)
            .map_err(|e| MemError::InvalidArgument(format!("host allocation layout: {e}")))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemError::device(
                "host_alloc",
                format!("allocation of {} bytes failed", layout.size()),
            ));
        }
        let base = BaseTensor::new(MemoryType::Host, info, ptr)?;
        Ok(Self { base, layout })
    }

    /// Allocate and copy `bytes` in; `bytes` must cover `info.nbytes()`.
    pub fn from_bytes(info: TensorInfo, bytes: &[u8]) -> Result<Self> {
        let need = info.nbytes();
        if bytes.len() < need {
            return Err(MemError::InvalidArgument(format!(
                "buffer of {} bytes is smaller than tensor extent {need}",
                bytes.len()
            )));
        }
        let mut tensor = Self::zeroed(info)?;
        tensor.as_bytes_mut().copy_from_slice(&bytes[..need]);
        Ok(tensor)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: we own an allocation of at least nbytes.
        unsafe { std::slice::from_raw_parts(self.ptr(), self.info().nbytes()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive borrow of our own allocation.
        unsafe { std::slice::from_raw_parts_mut(self.ptr(), self.info().nbytes()) }
    }

    #[inline]
    fn ptr(&self) -> *mut u8 {
        self.base.data().as_ptr().cast::<u8>()
    }
}

impl Tensor for OwnedHostTensor {
    fn base(&self) -> &BaseTensor {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTensor {
        &mut self.base
    }

    fn is_owning(&self) -> bool {
        true
    }

    fn host_bytes(&self) -> Result<&[u8]> {
        Ok(self.as_bytes())
    }
}

impl Drop for OwnedHostTensor {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr(), self.layout) }
    }
}

// ─── Device, borrowed ────────────────────────────────────────────────────────

/// Non-owning tensor over a device address.  `data()` must not be
/// dereferenced from host code.
#[derive(Clone, Debug)]
pub struct DeviceTensor {
    base: BaseTensor,
}

impl DeviceTensor {
    /// Wrap a device address.  Host memory is rejected (use [`HostTensor`]).
    pub fn new(memory_type: MemoryType, info: TensorInfo, addr: u64) -> Result<Self> {
        if memory_type.is_host_accessible() {
            return Err(MemError::InvalidArgument(format!(
                "DeviceTensor cannot wrap {memory_type} memory"
            )));
        }
        let base = BaseTensor::new(memory_type, info, addr as usize as *mut c_void)?;
        Ok(Self { base })
    }
}

impl Tensor for DeviceTensor {
    fn base(&self) -> &BaseTensor {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseTensor {
        &mut self.base
    }

    fn is_owning(&self) -> bool {
        false
    }
}
