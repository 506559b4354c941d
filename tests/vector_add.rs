use rand::Rng;
use std::slice;
use vmm_rs::{
    AllocatorConfig, DeviceId, DevicePtr, GranularityKind, HostDeviceSpec, HostDriver,
    MultiDeviceAllocator,
};

const N: usize = 50_000;
const KB: usize = 1024;
const MB: usize = 1024 * KB;

fn random_vec(n: usize) -> Vec<f32> {
    let mut rng = rand::rng();
    (0..n).map(|_| rng.random::<f32>()).collect()
}

/// Copies `src` into device memory at `dst`.
fn copy_to_device(dst: DevicePtr, src: &[f32]) {
    unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut f32, src.len()) };
}

fn copy_from_device(dst: &mut [f32], src: DevicePtr) {
    unsafe { std::ptr::copy_nonoverlapping(src as *const f32, dst.as_mut_ptr(), dst.len()) };
}

/// C = A + B, with the index space split across one worker per mapping device.
fn vec_add(a: DevicePtr, b: DevicePtr, c: DevicePtr, n: usize, workers: usize) {
    let (a, b, c) = unsafe {
        (
            slice::from_raw_parts(a as *const f32, n),
            slice::from_raw_parts(b as *const f32, n),
            slice::from_raw_parts_mut(c as *mut f32, n),
        )
    };
    let per = n.div_ceil(workers);
    std::thread::scope(|s| {
        for ((ca, aa), ba) in c.chunks_mut(per).zip(a.chunks(per)).zip(b.chunks(per)) {
            s.spawn(move || {
                for ((ci, ai), bi) in ca.iter_mut().zip(aa).zip(ba) {
                    *ci = ai + bi;
                }
            });
        }
    });
}

fn run(alloc: &MultiDeviceAllocator<HostDriver>, mapping: &[DeviceId]) {
    let size = N * std::mem::size_of::<f32>();
    let backing = alloc.backing_devices_for(mapping[0]).unwrap();

    let (d_a, allocation_size) = alloc.allocate(size, &backing, mapping).unwrap();
    let (d_b, _) = alloc.allocate(size, &backing, mapping).unwrap();
    let (d_c, _) = alloc.allocate(size, &backing, mapping).unwrap();
    assert!(allocation_size >= size);

    let h_a = random_vec(N);
    let h_b = random_vec(N);
    copy_to_device(d_a, &h_a);
    copy_to_device(d_b, &h_b);

    vec_add(d_a, d_b, d_c, N, mapping.len());

    let mut h_c = vec![0f32; N];
    copy_from_device(&mut h_c, d_c);
    for i in 0..N {
        let sum = h_a[i] + h_b[i];
        assert!((h_c[i] - sum).abs() <= 1e-7, "mismatch at {i}: {} != {sum}", h_c[i]);
    }

    for ptr in [d_a, d_b, d_c] {
        alloc.free(ptr, allocation_size).unwrap();
    }
    assert_eq!(alloc.live_allocations(), 0);
    let drv = alloc.driver();
    assert_eq!(drv.live_handles(), 0);
    assert_eq!(drv.live_mappings(), 0);
    assert_eq!(drv.live_reservations(), 0);
}

#[test]
fn vector_add_single_device() {
    let alloc = MultiDeviceAllocator::new(HostDriver::uniform(1, 64 * MB).unwrap());
    run(&alloc, &[DeviceId(0)]);
}

#[test]
fn vector_add_striped_over_peers() {
    // Small minimum granularity so the 200 KB vectors really span all four devices.
    let drv = HostDriver::builder()
        .devices((0..4).map(|i| HostDeviceSpec::new(format!("gpu{i}"), 64 * MB).granularity(64 * KB, 0)))
        .fully_connected()
        .aperture_size(256 * MB)
        .build()
        .unwrap();
    let alloc = MultiDeviceAllocator::with_config(
        drv,
        AllocatorConfig::new().granularity(GranularityKind::Minimum),
    );

    let size = N * std::mem::size_of::<f32>();
    let backing = alloc.backing_devices_for(DeviceId(0)).unwrap();
    let (first, actual) = alloc.allocate(size, &backing, &[DeviceId(0)]).unwrap();
    assert_eq!(alloc.allocation(first).unwrap().chunks.len(), 4);
    assert_eq!(actual, 256 * KB);
    alloc.free(first, actual).unwrap();

    run(&alloc, &[DeviceId(0)]);
    run(&alloc, &[DeviceId(1), DeviceId(2)]);
}
