use texmap_core::info::default_strides;
use texmap_core::{
    DType, DataPtr, ErrorKind, HandleKind, HostTensor, MemoryType, NativeHandle, OwnedHostTensor,
    Tensor, TensorInfo,
};

#[test]
fn explicit_and_derived_strides_agree_on_size() {
    for (shape, dtype) in [
        (vec![1usize, 3, 224, 224], DType::F32),
        (vec![480, 640, 4], DType::U8),
        (vec![7, 5], DType::F16),
        (vec![1000], DType::I64),
    ] {
        let derived = TensorInfo::new(&shape, dtype).unwrap();
        let strides = default_strides(&shape, dtype).unwrap();
        let explicit = TensorInfo::with_strides(&shape, dtype, &strides).unwrap();
        assert_eq!(derived.nbytes(), explicit.nbytes());
        assert_eq!(derived.nbytes(), shape.iter().product::<usize>() * dtype.size_bytes());
        assert!(explicit.is_contiguous());
    }
}

#[test]
fn host_tensor_data_is_the_given_pointer() {
    let mut buf = vec![0u8; 2 * 8 * 4];
    let ptr = buf.as_mut_ptr();
    let info = TensorInfo::new(&[2, 8], DType::F32).unwrap();
    // SAFETY: `buf` outlives the tensor.
    let mut tensor = unsafe { HostTensor::from_raw(info, ptr) }.unwrap();
    assert_eq!(tensor.data(), DataPtr::new(ptr).unwrap());
    tensor.set_handle(HandleKind::DmaFd, NativeHandle(12));
    tensor.set_handle(HandleKind::Offset, NativeHandle(0));
    assert_eq!(tensor.data().as_ptr().cast::<u8>(), ptr);
    assert_eq!(tensor.memory_type(), MemoryType::Host);
    assert!(!tensor.is_owning());
    drop(tensor);
    buf[0] = 1;
}

#[test]
fn null_host_pointer_is_rejected() {
    let info = TensorInfo::new(&[4, 4], DType::U8).unwrap();
    // SAFETY: null is rejected before use.
    let err = unsafe { HostTensor::from_raw(info, std::ptr::null_mut::<f32>()) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn owned_tensor_copies_and_frees() {
    let info = TensorInfo::new(&[3, 3], DType::U8).unwrap();
    let bytes: Vec<u8> = (0..9).collect();
    let tensor = OwnedHostTensor::from_bytes(info.clone(), &bytes).unwrap();
    assert_eq!(tensor.host_bytes().unwrap(), &bytes[..]);
    assert!(tensor.is_owning());
    assert!(OwnedHostTensor::from_bytes(info, &bytes[..4]).is_err());
}

#[test]
fn transposed_views_size_to_their_last_element() {
    // A 3x4 row-major u8 buffer viewed as its 4x3 transpose.
    let info = TensorInfo::with_strides(&[4, 3], DType::U8, &[1, 4]).unwrap();
    assert_eq!(info.nbytes(), 3 + 2 * 4 + 1);
    assert!(!info.is_contiguous());
    let bytes: Vec<u8> = (0..12).collect();
    let tensor = HostTensor::from_slice(info.clone(), &bytes).unwrap();
    assert_eq!(tensor.host_bytes().unwrap().len(), 12);
    assert!(HostTensor::from_slice(info, &bytes[..11]).is_err());
}
