use std::sync::Arc;

use texmap_core::device::soft::SoftDevice;
use texmap_core::map::create_image_map;
use texmap_core::{
    ErrorKind, ImageMap, ImageMapExt, MemError, MemoryType, PassthroughMap, PixelFormat,
    SystemMemoryMap,
};

#[test]
fn hundred_cycles_allocate_one_staging() {
    let dev = Arc::new(SoftDevice::default());
    let tex = dev.alloc_texture(PixelFormat::Bgrx, 320, 240).unwrap();
    let mut map = SystemMemoryMap::new(dev.clone());

    for _ in 0..100 {
        let host = map.map(tex.image()).unwrap();
        assert_eq!(host.memory_type(), MemoryType::Host);
        map.unmap();
    }

    assert_eq!(dev.stats().staging_created, 1);
    let stats = map.stats().snapshot();
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.reuses, 99);
    assert_eq!(stats.copies, 100);
}

#[test]
fn double_map_is_invalid_state_and_stray_unmap_is_noop() {
    let dev = Arc::new(SoftDevice::default());
    let tex = dev.alloc_texture(PixelFormat::Nv12, 64, 64).unwrap();
    let mut map = SystemMemoryMap::new(dev.clone());

    map.unmap();
    assert!(!map.is_mapped());

    let first = map.map(tex.image()).unwrap();
    let err = map.map(tex.image()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(map.is_mapped());

    // The first mapping is untouched by the rejected second map.
    // SAFETY: still mapped.
    assert!(unsafe { first.plane_bytes(0) }.is_ok());
    map.unmap();
    map.unmap();
    assert_eq!(dev.stats().staging_live, 1);
}

#[test]
fn passthrough_returns_source_handle() {
    let dev = Arc::new(SoftDevice::default());
    let tex = dev.alloc_texture(PixelFormat::Rgbp, 32, 32).unwrap();
    let mut map = PassthroughMap::new(MemoryType::SoftDevice);

    let view = map.map(tex.image()).unwrap();
    assert_eq!(view.data(), tex.image().data());
    assert_eq!(view.memory_type(), MemoryType::SoftDevice);
    map.unmap();

    assert_eq!(dev.stats().staging_created, 0);
    assert_eq!(dev.stats().textures_live, 1);
    assert_eq!(tex.image().data(), view.data());
}

#[test]
fn nv12_vga_maps_with_consistent_strides() {
    let dev = Arc::new(SoftDevice::default());
    let mut tex = dev.alloc_texture(PixelFormat::Nv12, 640, 480).unwrap();
    tex.fill_plane(0, |r, _| (r % 251) as u8).unwrap();
    tex.fill_plane(1, |_, c| (c % 2) as u8 + 128).unwrap();
    let mut map = SystemMemoryMap::new(dev.clone());

    {
        let host = map.map_scoped(tex.image()).unwrap();
        assert_eq!(host.num_planes(), 2);
        let luma = host.plane(0).unwrap();
        let chroma = host.plane(1).unwrap();
        assert!(luma.stride >= 640);
        assert!(chroma.stride >= 320 * 2);
        assert!(chroma.offset >= luma.stride * 480);

        let info = host.plane_info(1).unwrap();
        assert_eq!(info.shape(), &[240, 320, 2]);

        let y = host.plane_bytes(0).unwrap();
        assert_eq!(y[luma.stride * 479], (479 % 251) as u8);
        let uv = host.plane_bytes(1).unwrap();
        assert_eq!(&uv[..4], &[128, 129, 128, 129]);
    }

    let again = map.map(tex.image()).unwrap();
    assert_eq!(again.num_planes(), 2);
    map.unmap();
    assert_eq!(dev.stats().staging_created, 1);
}

#[test]
fn smaller_nv12_reuses_both_planes_of_the_larger_staging() {
    let dev = Arc::new(SoftDevice::default());
    let mut big = dev.alloc_texture(PixelFormat::Nv12, 64, 64).unwrap();
    big.fill_plane(0, |_, _| 0xEE).unwrap();
    big.fill_plane(1, |_, _| 0xDD).unwrap();
    let mut small = dev.alloc_texture(PixelFormat::Nv12, 32, 16).unwrap();
    small.fill_plane(0, |r, c| (r * 32 + c) as u8).unwrap();
    small.fill_plane(1, |r, c| (100 + r * 32 + c) as u8).unwrap();
    let mut map = SystemMemoryMap::new(dev.clone());

    let big_chroma = {
        let host = map.map_scoped(big.image()).unwrap();
        host.plane(1).unwrap()
    };

    let host = map.map_scoped(small.image()).unwrap();
    assert_eq!((host.width(), host.height()), (32, 16));
    // Plane placement comes from the 64x64 surface being reused.
    assert_eq!(host.plane(1).unwrap(), big_chroma);
    let luma = host.plane(0).unwrap();
    assert_eq!(big_chroma.offset, luma.stride * 64);

    let y = host.plane_bytes(0).unwrap();
    assert_eq!(y.len(), luma.stride * 16);
    for r in 0..16 {
        let row = &y[r * luma.stride..r * luma.stride + 32];
        assert!(row.iter().enumerate().all(|(c, &b)| b == (r * 32 + c) as u8), "luma row {r}");
    }
    let uv = host.plane_bytes(1).unwrap();
    assert_eq!(uv.len(), big_chroma.stride * 8);
    for r in 0..8 {
        let row = &uv[r * big_chroma.stride..r * big_chroma.stride + 32];
        assert!(
            row.iter().enumerate().all(|(c, &b)| b == (100 + r * 32 + c) as u8),
            "chroma row {r}"
        );
    }
    drop(host);

    assert_eq!(dev.stats().staging_created, 1);
    assert_eq!(map.stats().snapshot().reuses, 1);
}

#[test]
fn oversized_images_fail_before_any_staging_exists() {
    let dev = Arc::new(SoftDevice::default());
    let err = dev
        .alloc_texture(PixelFormat::Nv12, u32::MAX, u32::MAX)
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.error_code(), 100);
    assert_eq!(dev.stats().staging_created, 0);
    assert_eq!(dev.stats().textures_live, 0);
}

#[test]
fn boxed_mappers_share_the_protocol() {
    let dev = Arc::new(SoftDevice::default());
    let tex = dev.alloc_texture(PixelFormat::I420, 33, 17).unwrap();
    let mut mappers = vec![
        create_image_map(MemoryType::SoftDevice, MemoryType::Host, dev.clone()).unwrap(),
        create_image_map(MemoryType::SoftDevice, MemoryType::SoftDevice, dev.clone()).unwrap(),
    ];
    for mapper in &mut mappers {
        let image = mapper.map(tex.image()).unwrap();
        assert_eq!(image.memory_type(), mapper.target_memory_type());
        assert_eq!(image.num_planes(), 3);
        assert!(matches!(
            mapper.map(tex.image()),
            Err(MemError::InvalidState(_))
        ));
        mapper.unmap();
    }
}
