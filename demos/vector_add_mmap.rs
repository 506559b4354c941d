//! Vector addition `C = A + B` on memory allocated with the multi-device allocator.
//!
//! The three vectors are each one contiguous range whose physical backing is striped over
//! every device the chosen device can reach. The add itself only ever sees plain pointers.
//!
//! Usage: `vector_add_mmap [--devices N] [--device D]`

use clap::Parser;
use rand::Rng;
use std::process::ExitCode;
use std::slice;
use vmm_rs::{DeviceId, DevicePtr, HostDriver, MultiDeviceAllocator, VmmDriver, VmmError};

const N: usize = 50_000;
const THREADS_PER_BLOCK: usize = 256;

/// CLI arguments for the `vector_add_mmap` demo.
#[derive(Debug, Parser)]
struct Args {
    /// Number of simulated devices.
    #[clap(long, default_value = "2")]
    devices: u32,
    /// Device the add runs on. Its peers back the vectors.
    #[clap(long, default_value = "0")]
    device: u32,
}

impl Args {
    fn check(&self) -> Result<(), String> {
        if self.devices == 0 || self.device >= self.devices {
            return Err(format!(
                "device {} out of range for {} devices",
                self.device, self.devices
            ));
        }
        Ok(())
    }
}

fn random_init(data: &mut [f32]) {
    let mut rng = rand::rng();
    for x in data {
        *x = rng.random::<f32>();
    }
}

/// One "block" of the kernel per thread.
fn launch_vec_add(a: DevicePtr, b: DevicePtr, c: DevicePtr, n: usize) {
    let (a, b, c) = unsafe {
        (
            slice::from_raw_parts(a as *const f32, n),
            slice::from_raw_parts(b as *const f32, n),
            slice::from_raw_parts_mut(c as *mut f32, n),
        )
    };
    let blocks = n.div_ceil(THREADS_PER_BLOCK);
    let per_worker = blocks
        .div_ceil(std::thread::available_parallelism().map_or(1, usize::from))
        * THREADS_PER_BLOCK;

    std::thread::scope(|s| {
        for ((c, a), b) in c
            .chunks_mut(per_worker)
            .zip(a.chunks(per_worker))
            .zip(b.chunks(per_worker))
        {
            s.spawn(move || {
                for ((ci, ai), bi) in c.iter_mut().zip(a).zip(b) {
                    *ci = ai + bi;
                }
            });
        }
    });
}

fn run(devices: u32, device: u32) -> Result<bool, VmmError> {
    let size = N * std::mem::size_of::<f32>();
    let alloc = MultiDeviceAllocator::new(HostDriver::uniform(devices, 256 << 20)?);
    let cu_device = DeviceId(device);

    if !alloc.driver().supports_vmm(cu_device)? {
        println!("Device {device} doesn't support VIRTUAL ADDRESS MANAGEMENT.");
        return Ok(true);
    }
    println!("Device {device} VIRTUAL ADDRESS MANAGEMENT SUPPORTED = 1.");

    // The add runs on `cu_device`, so that is where the allocations are mapped.
    let mapping = [cu_device];
    let backing = alloc.backing_devices_for(cu_device)?;
    println!("Backing devices: {backing:?}");

    let (d_a, allocation_size) = alloc.allocate(size, &backing, &mapping)?;
    let (d_b, _) = alloc.allocate(size, &backing, &mapping)?;
    let (d_c, _) = alloc.allocate(size, &backing, &mapping)?;
    println!("Allocated 3 x {allocation_size} bytes for {size} byte vectors");

    let mut h_a = vec![0f32; N];
    let mut h_b = vec![0f32; N];
    let mut h_c = vec![0f32; N];
    random_init(&mut h_a);
    random_init(&mut h_b);

    unsafe {
        std::ptr::copy_nonoverlapping(h_a.as_ptr(), d_a as *mut f32, N);
        std::ptr::copy_nonoverlapping(h_b.as_ptr(), d_b as *mut f32, N);
    }

    launch_vec_add(d_a, d_b, d_c, N);

    unsafe {
        std::ptr::copy_nonoverlapping(d_c as *const f32, h_c.as_mut_ptr(), N);
    }

    let pass = (0..N).all(|i| (h_c[i] - (h_a[i] + h_b[i])).abs() <= 1e-7);

    for ptr in [d_a, d_b, d_c] {
        alloc.free(ptr, allocation_size)?;
    }
    Ok(pass)
}

fn main() -> ExitCode {
    env_logger::init();
    println!("Vector Addition (multi-device VMM)");

    let args = Args::parse();
    if let Err(e) = args.check() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(args.devices, args.device) {
        Ok(pass) => {
            println!("Result = {}", if pass { "PASS" } else { "FAIL" });
            if pass {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
