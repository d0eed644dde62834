//! Integration tests that exercise a real Vulkan implementation.
//!
//! Every test begins by trying to load Vulkan and create a device; on
//! hosts with no driver (CI containers) that fails and the test passes
//! vacuously. The assertions only run where an implementation exists.

use std::sync::Arc;

use rcompute_vk::ash::vk;
use rcompute_vk::{
    DeviceBuffer, Fence, Instance, QueueDemand, QueueRole, QueueSpec,
    TransferEngine, VulkanLogLevel,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Instance + default-demand device, or `None` when the host has no
/// usable Vulkan implementation.
fn compute_device() -> Option<(Arc<Instance>, Arc<rcompute_vk::Device>)> {
    init_tracing();
    // SAFETY: Loading the system Vulkan library in a test process.
    let instance = unsafe {
        Instance::for_compute("rcompute-vk tests", Some(VulkanLogLevel::Warning))
    }
    .ok()?;
    let instance = Arc::new(instance);
    let physical = instance.default_compute_device().ok()?;
    let device = physical.compute_device(&QueueDemand::Default).ok()?;
    Some((instance, Arc::new(device)))
}

#[test]
fn default_device_has_compute_and_transfer_queues() {
    let Some((_instance, device)) = compute_device() else {
        return;
    };

    assert!(device.num_queues(QueueRole::Compute) >= 1);
    assert!(device.num_queues(QueueRole::Transfer) >= 1);
    assert!(device.compute_queue().is_ok());
    assert!(device.transfer_queue().is_ok());
}

#[test]
fn mapped_write_then_read_back() {
    let Some((_instance, device)) = compute_device() else {
        return;
    };

    let mut buffer = DeviceBuffer::host_visible(
        &device,
        128 * size_of::<f32>() as vk::DeviceSize,
        Some("map round trip"),
    )
    .unwrap();
    assert!(buffer.is_host_visible());
    assert!(
        buffer
            .actual_flags()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    );

    let values: Vec<f32> = (0..128).map(|i| i as f32 * 0.5).collect();
    buffer.write_pod(&values).unwrap();

    let read_back: Vec<f32> = buffer.read_pod().unwrap();
    assert_eq!(read_back, values);
}

#[test]
fn buffer_copy_moves_128_elements() {
    let Some((_instance, device)) = compute_device() else {
        return;
    };

    let size = 128 * size_of::<f32>() as vk::DeviceSize;
    let mut src =
        DeviceBuffer::host_visible(&device, size, Some("copy src")).unwrap();
    let mut dst =
        DeviceBuffer::host_visible(&device, size, Some("copy dst")).unwrap();

    src.write_pod(&vec![1.0f32; 128]).unwrap();
    dst.write_pod(&vec![2.0f32; 128]).unwrap();

    let mut engine = TransferEngine::new(&device).unwrap();
    engine.copy_buffer_to_buffer(&src, &dst, size, 0, 0).unwrap();

    let out: Vec<f32> = dst.read_pod().unwrap();
    assert_eq!(out, vec![1.0f32; 128]);
}

#[test]
fn staged_round_trip_through_device_local() {
    let Some((_instance, device)) = compute_device() else {
        return;
    };

    let size = 128 * size_of::<f32>() as vk::DeviceSize;
    let mut staging =
        DeviceBuffer::host_visible(&device, size, Some("staging")).unwrap();
    let local =
        DeviceBuffer::device_local(&device, size, Some("local")).unwrap();
    assert!(
        local
            .actual_flags()
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    );

    let values: Vec<f32> = (0..128).map(|i| (i % 7) as f32).collect();
    staging.write_pod(&values).unwrap();

    let mut engine = TransferEngine::new(&device).unwrap();
    engine
        .copy_buffer_to_buffer(&staging, &local, size, 0, 0)
        .unwrap();

    // Scrub the staging buffer, then pull the data back down.
    staging.write_pod(&vec![0.0f32; 128]).unwrap();
    engine
        .copy_buffer_to_buffer(&local, &staging, size, 0, 0)
        .unwrap();

    let out: Vec<f32> = staging.read_pod().unwrap();
    assert_eq!(out, values);
}

#[test]
fn out_of_bounds_copy_is_rejected_before_submission() {
    let Some((_instance, device)) = compute_device() else {
        return;
    };

    let src = DeviceBuffer::host_visible(&device, 256, None).unwrap();
    let dst = DeviceBuffer::host_visible(&device, 128, None).unwrap();
    let mut engine = TransferEngine::new(&device).unwrap();

    assert!(
        engine.copy_buffer_to_buffer(&src, &dst, 256, 0, 0).is_err()
    );
    assert!(
        engine.copy_buffer_to_buffer(&src, &dst, 64, 224, 0).is_err()
    );
    assert!(engine.copy_buffer_to_buffer(&src, &dst, 64, 0, 64).is_ok());
}

#[test]
fn fence_state_machine_round_trip() {
    let Some((_instance, device)) = compute_device() else {
        return;
    };

    let mut fence = Fence::new(&device, false, Some("test fence")).unwrap();
    assert!(fence.is_ready());
    assert!(fence.wait(0).is_err());
    assert!(fence.wait_nonblocking().is_err());

    let queue = device.transfer_queue().unwrap().clone();
    // Empty submission that only signals the fence.
    let submit_info = vk::SubmitInfo::default();
    // SAFETY: queue belongs to device; fence is unsignaled and not
    // pending.
    unsafe {
        device
            .queue_submit(
                &queue,
                std::slice::from_ref(&submit_info),
                fence.raw_fence(),
            )
            .unwrap();
        fence.mark_submitted().unwrap();
    }
    assert!(fence.is_submitted());

    // SAFETY: The fence was submitted above; no other thread touches it.
    unsafe { fence.wait_and_reset(u64::MAX) }.unwrap();
    assert!(fence.is_ready());

    // An empty submission that already went through the wait above has
    // signaled; a fresh poll on the reset fence must refuse again.
    assert!(fence.wait_nonblocking().is_err());
}

#[test]
fn attach_queues_merges_grows_and_rejects_overreach() {
    init_tracing();
    // SAFETY: Loading the system Vulkan library in a test process.
    let Ok(instance) =
        (unsafe { Instance::for_compute("rcompute-vk tests", None) })
    else {
        return;
    };
    let instance = Arc::new(instance);
    let Ok(physical) = instance.default_compute_device() else {
        return;
    };
    let Ok(mut device) = physical.compute_device(&QueueDemand::Default) else {
        return;
    };

    // Re-attaching an already-satisfied demand leaves the plan alone.
    let before = device.queue_plan().clone();
    // SAFETY: no child objects of the device exist and nothing is
    // submitted.
    unsafe { device.attach_queues(&QueueDemand::Default) }.unwrap();
    assert_eq!(device.queue_plan(), &before);

    // Growing to everything the hardware reports.
    // SAFETY: still no child objects and no submitted work.
    unsafe { device.attach_queues(&QueueDemand::All) }.unwrap();
    for family in physical.queue_families() {
        assert_eq!(
            device.queue_plan().granted(family.family_id),
            family.queue_count
        );
    }

    // Asking past a family's capacity fails and must not touch the
    // device: the plan stays at the grown state and the device still
    // answers.
    let grown = device.queue_plan().clone();
    let family0 = physical.queue_families()[0];
    let overreach = QueueDemand::Explicit(vec![QueueSpec {
        family_id: family0.family_id,
        first_index: family0.queue_count,
        count: 1,
    }]);
    // SAFETY: still no child objects and no submitted work.
    assert!(unsafe { device.attach_queues(&overreach) }.is_err());
    assert_eq!(device.queue_plan(), &grown);
    assert!(device.compute_queue().is_ok());
    device.wait_idle().unwrap();
}

#[test]
fn all_demand_grants_every_reported_queue() {
    init_tracing();
    // SAFETY: Loading the system Vulkan library in a test process.
    let Ok(instance) =
        (unsafe { Instance::for_compute("rcompute-vk tests", None) })
    else {
        return;
    };
    let instance = Arc::new(instance);
    let Ok(physical) = instance.default_compute_device() else {
        return;
    };

    let Ok(device) = physical.compute_device(&QueueDemand::All) else {
        return;
    };
    for family in physical.queue_families() {
        assert_eq!(device.queue_plan().granted(family.family_id), family.queue_count);
    }
    assert_eq!(
        device.num_queues(QueueRole::Compute),
        physical.num_compute_queues() as usize
    );
}
