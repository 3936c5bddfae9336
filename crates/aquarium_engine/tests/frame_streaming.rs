//! End-to-end frame loop against the headless device: reserve staging
//! space, write per-instance transforms, flush, and verify the bytes that
//! land in the instance buffer.

use approx::assert_relative_eq;
use nalgebra::Matrix4;

use aquarium_engine::{
    new_streaming_allocator, BindMode, GpuDevice, HeadlessDevice, InstanceResources, UploadMode,
    BUFFER_PER_ALLOCATE_SIZE,
};

const INSTANCE_SIZE: u64 = std::mem::size_of::<[[f32; 4]; 4]>() as u64;

fn transform_for(instance: u32, frame: u64) -> Matrix4<f32> {
    let t = frame as f32 * 0.016;
    Matrix4::new_translation(&nalgebra::Vector3::new(
        instance as f32,
        t.sin(),
        t.cos(),
    ))
}

fn run_frames(mode: UploadMode, frames: u64, population: &[u32]) {
    let mut device = HeadlessDevice::new();
    let mut resources = InstanceResources::new(BindMode::DynamicOffset, INSTANCE_SIZE);
    let mut allocator = new_streaming_allocator(mode, 1024 * 1024);

    let mut peak = 0;
    for frame in 0..frames {
        let count = population[frame as usize % population.len()];
        peak = peak.max(count);

        resources.ensure_capacity(&mut device, count).unwrap();
        let dst = resources.buffer().unwrap();

        // Uploaded in chunks of at most one staging buffer's worth of
        // instances, the same way the benchmark loop does it.
        let chunk_instances = (BUFFER_PER_ALLOCATE_SIZE / resources.stride()) as u32;
        let mut base = 0;
        while base < count {
            let chunk = chunk_instances.min(count - base);
            let alloc = allocator
                .allocate(&mut device, resources.stride() * u64::from(chunk))
                .unwrap()
                .expect("population fits the pool cap");

            for slot in 0..chunk {
                let instance = base + slot;
                let matrix = transform_for(instance, frame);
                let cells: [[f32; 4]; 4] = matrix.into();
                allocator
                    .push(
                        &mut device,
                        alloc.ring,
                        dst,
                        alloc.offset + resources.stride() * u64::from(slot),
                        resources.instance_offset(instance),
                        bytemuck::bytes_of(&cells),
                    )
                    .unwrap();
            }
            base += chunk;
        }

        allocator.flush(&mut device).unwrap();
        device.poll().unwrap();

        // Capacity never shrinks, whatever the population does.
        assert_eq!(resources.capacity(), peak);

        // Spot-check the last instance written this frame.
        if count > 0 {
            let offset = resources.instance_offset(count - 1) as usize;
            let bytes = &device.buffer_contents(dst).unwrap()
                [offset..offset + INSTANCE_SIZE as usize];
            let cells: [[f32; 4]; 4] = bytemuck::pod_read_unaligned(bytes);
            let expected: [[f32; 4]; 4] = transform_for(count - 1, frame).into();
            for (col, expected_col) in cells.iter().zip(expected.iter()) {
                for (value, expected_value) in col.iter().zip(expected_col.iter()) {
                    assert_relative_eq!(value, expected_value);
                }
            }
        }
    }

    allocator.destroy(&mut device);
    resources.destroy(&mut device);
    assert_eq!(device.buffer_count(), 0);
}

#[test]
fn test_sync_policy_full_frames() {
    run_frames(UploadMode::Sync, 12, &[100, 100, 150, 50, 150]);
}

#[test]
fn test_async_policy_full_frames() {
    run_frames(UploadMode::Async, 12, &[100, 100, 150, 50, 150]);
}

#[test]
fn test_async_school_exceeding_one_staging_buffer() {
    // 1025 instances at a 256-byte stride need more than one fixed-size
    // staging buffer per frame; the upload must proceed through multiple
    // reservations instead of failing on an oversized request.
    run_frames(UploadMode::Async, 6, &[1025, 2000]);
}

#[test]
fn test_growing_population_reallocates_once_per_step() {
    let mut device = HeadlessDevice::new();
    let mut resources = InstanceResources::new(BindMode::PerInstance, INSTANCE_SIZE);

    resources.ensure_capacity(&mut device, 100).unwrap();
    resources.ensure_capacity(&mut device, 50).unwrap();
    resources.ensure_capacity(&mut device, 150).unwrap();

    assert_eq!(resources.reallocations(), 2);
    assert_eq!(resources.capacity(), 150);
    assert_eq!(resources.bind_group_count(), 150);
}
