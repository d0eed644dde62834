//! Logical device creation, queue handles, and raw Vulkan wrappers.
//!
//! [`Device`] owns the `ash::Device` and the queues requested through a
//! [`QueueAllocationPlan`]. Most of its surface is thin `unsafe fn`
//! wrappers over raw Vulkan entry points; each one restates the
//! preconditions it forwards to the caller. Sibling modules
//! ([`crate::buffer`], [`crate::image`], [`crate::command`],
//! [`crate::sync`], [`crate::transfer`]) build safe RAII types on top
//! of these wrappers.

use std::{
    collections::BTreeMap,
    ffi::{CStr, CString},
    sync::{Arc, Mutex},
};

use ash::vk;
use thiserror::Error;

use crate::instance::Instance;
use crate::physical::{MemoryTypeTable, PhysicalDevice, QueueFamilyInfo};
use crate::queue::{self, PlanQueuesError, QueueAllocationPlan, QueueDemand};

/// The role a queue was granted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Compute,
    Transfer,
}

/// A handle to one device queue.
///
/// Cheap to clone; clones of the same handle share a mutex so that
/// submissions through either clone serialize on the underlying
/// `vk::Queue`, which Vulkan requires to be externally synchronized.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    queue: Arc<Mutex<vk::Queue>>,
    family_id: u32,
    index_in_family: u32,
    compute: bool,
    transfer: bool,
}

impl QueueHandle {
    pub fn family_id(&self) -> u32 {
        self.family_id
    }

    pub fn index_in_family(&self) -> u32 {
        self.index_in_family
    }

    pub fn can_compute(&self) -> bool {
        self.compute
    }

    pub fn can_transfer(&self) -> bool {
        self.transfer
    }

    pub fn supports(&self, role: QueueRole) -> bool {
        match role {
            QueueRole::Compute => self.compute,
            QueueRole::Transfer => self.transfer,
        }
    }
}

/// A logical device plus the queues it was created with.
///
/// Holds an `Arc<Instance>` so the instance outlives every device.
/// Child resources hold an `Arc<Device>` in turn.
pub struct Device {
    parent: Arc<Instance>,
    handle: ash::Device,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_types: MemoryTypeTable,
    families: Vec<QueueFamilyInfo>,
    plan: QueueAllocationPlan,
    queues: Vec<QueueHandle>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        //SAFETY: All objects derived from this device should be dropped
        //before this device is dropped.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error(transparent)]
    PlanQueues(#[from] PlanQueuesError),

    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "No {role:?} queue at index {index}, device has {available} \
     {role:?}-capable queue(s)"
)]
pub struct QueueIndexOutOfRange {
    pub role: QueueRole,
    pub index: usize,
    pub available: usize,
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

impl Device {
    /// Create a logical device on `physical` with the queues described
    /// by `plan`.
    ///
    /// The plan is validated against the family snapshot again here:
    /// a plan asking for more queues than a family offers fails, it is
    /// never clamped. Use [`PhysicalDevice::compute_device`] to go from
    /// a [`QueueDemand`] straight to a device.
    pub fn create(
        instance: &Arc<Instance>,
        physical: &PhysicalDevice,
        plan: QueueAllocationPlan,
    ) -> Result<Self, CreateDeviceError> {
        let families = physical.queue_families().to_vec();
        validate_plan(&families, &plan)?;

        let raw_physical = physical.raw_physical_device();
        let handle = create_ash_device(instance, raw_physical, &plan)?;
        let queues = fetch_queues(&handle, &plan);
        let debug_utils_device =
            instance.create_debug_utils_device_loader(&handle);

        tracing::debug!(
            "Created device {:?} on {:?} with {} queue(s)",
            handle.handle(),
            physical.name(),
            queues.len()
        );

        Ok(Self {
            parent: instance.clone(),
            handle,
            debug_utils_device,
            physical_device: raw_physical,
            properties: *physical.properties(),
            memory_types: physical.memory_types().clone(),
            families,
            plan,
            queues,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_types(&self) -> &MemoryTypeTable {
        &self.memory_types
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    pub fn queue_families(&self) -> &[QueueFamilyInfo] {
        &self.families
    }

    /// The plan this device's queues were created from.
    pub fn queue_plan(&self) -> &QueueAllocationPlan {
        &self.plan
    }

    /// All queues, family order then index order.
    pub fn queues(&self) -> &[QueueHandle] {
        &self.queues
    }

    pub fn num_queues(&self, role: QueueRole) -> usize {
        self.queues.iter().filter(|q| q.supports(role)).count()
    }

    /// The `index`-th queue supporting `role`, counting in family order.
    pub fn queue(
        &self,
        role: QueueRole,
        index: usize,
    ) -> Result<&QueueHandle, QueueIndexOutOfRange> {
        self.queues
            .iter()
            .filter(|q| q.supports(role))
            .nth(index)
            .ok_or_else(|| QueueIndexOutOfRange {
                role,
                index,
                available: self.num_queues(role),
            })
    }

    /// The first transfer-capable queue.
    pub fn transfer_queue(&self) -> Result<&QueueHandle, QueueIndexOutOfRange> {
        self.queue(QueueRole::Transfer, 0)
    }

    /// The first compute-capable queue.
    pub fn compute_queue(&self) -> Result<&QueueHandle, QueueIndexOutOfRange> {
        self.queue(QueueRole::Compute, 0)
    }

    /// Re-plan queues for `demand` and recreate the logical device with
    /// the union of the current plan and the new one (per family the
    /// larger count wins, roles are unioned). Attaching a demand the
    /// device already satisfies is a no-op. Growth past what a family
    /// offers fails before any Vulkan call is made and leaves the
    /// device untouched.
    ///
    /// Vulkan cannot add queues to a live `VkDevice`, so growth means a
    /// new `VkDevice`. The old device handle is destroyed and every
    /// handle derived from it dies with it.
    ///
    /// # Safety
    /// No child object of this device (buffers, images, command pools,
    /// fences, queue handle clones) may be alive, and no submitted work
    /// may still be executing.
    pub unsafe fn attach_queues(
        &mut self,
        demand: &QueueDemand,
    ) -> Result<(), CreateDeviceError> {
        let wanted = queue::plan(&self.families, demand)?;
        let merged = self.plan.merge(&wanted);
        if merged == self.plan {
            return Ok(());
        }
        validate_plan(&self.families, &merged)?;

        let new_handle =
            create_ash_device(&self.parent, self.physical_device, &merged)?;
        let new_queues = fetch_queues(&new_handle, &merged);
        let new_debug_utils =
            self.parent.create_debug_utils_device_loader(&new_handle);

        tracing::debug!(
            "Recreating device {:?} as {:?} to attach queues",
            self.handle.handle(),
            new_handle.handle()
        );

        let old_handle =
            std::mem::replace(&mut self.handle, new_handle);
        //SAFETY: Caller guarantees no child objects and no in-flight
        //work remain on the old device.
        unsafe { old_handle.destroy_device(None) };

        self.debug_utils_device = new_debug_utils;
        self.plan = merged;
        self.queues = new_queues;
        Ok(())
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    /// Wait until all submitted work on this device has completed.
    ///
    /// This may block the calling thread and should generally be used for
    /// coarse-grained transitions (shutdown, device recreation) rather
    /// than hot paths.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: `self.handle` is a valid logical device for the lifetime of
        // `self`, and this call has no additional pointer preconditions.
        unsafe { self.handle.device_wait_idle() }
    }

    /// Submit work to `queue`, locking it for the duration of the call.
    ///
    /// # Safety
    /// `queue` must belong to this device. Every handle referenced by
    /// `submits` and `fence` must be derived from this device, and
    /// `fence` (if any) must be unsignaled and not already pending.
    pub unsafe fn queue_submit(
        &self,
        queue: &QueueHandle,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let guard = queue
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // SAFETY: The lock gives us exclusive access to the queue for
        // the duration of the call; the caller guarantees handle
        // provenance and fence state.
        unsafe { self.handle.queue_submit(*guard, submits, fence) }
    }

    /// Block until `queue` has drained, locking it for the duration.
    ///
    /// # Safety
    /// `queue` must belong to this device.
    pub unsafe fn queue_wait_idle(
        &self,
        queue: &QueueHandle,
    ) -> Result<(), vk::Result> {
        let guard = queue
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // SAFETY: The lock gives us exclusive access to the queue; the
        // caller guarantees it belongs to this device.
        unsafe { self.handle.queue_wait_idle(*guard) }
    }
}

fn validate_plan(
    families: &[QueueFamilyInfo],
    plan: &QueueAllocationPlan,
) -> Result<(), CreateDeviceError> {
    for entry in plan.entries() {
        let family = families
            .iter()
            .find(|f| f.family_id == entry.family_id)
            .ok_or(PlanQueuesError::UnknownFamily {
                family_id: entry.family_id,
            })?;
        if entry.count > family.queue_count {
            return Err(PlanQueuesError::InsufficientQueues {
                family_id: entry.family_id,
                requested: entry.count,
                available: family.queue_count,
            }
            .into());
        }
    }
    Ok(())
}

fn create_ash_device(
    instance: &Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    plan: &QueueAllocationPlan,
) -> Result<ash::Device, CreateDeviceError> {
    // One create info per family, counts aggregated since Vulkan
    // rejects duplicate queue_family_index entries.
    let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
    for entry in plan.entries() {
        let count = counts.entry(entry.family_id).or_insert(0);
        *count = (*count).max(entry.count);
    }

    let priorities: Vec<Vec<f32>> = counts
        .values()
        .map(|&count| vec![1.0; count as usize])
        .collect();
    let queue_create_infos: Vec<_> = counts
        .keys()
        .zip(priorities.iter())
        .map(|(&family_id, priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family_id)
                .queue_priorities(priorities)
        })
        .collect();

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos);

    // SAFETY: physical_device was enumerated from instance and the
    // create info's queue counts were validated against the family
    // snapshot.
    unsafe { instance.create_ash_device(physical_device, &create_info) }
        .map_err(CreateDeviceError::DeviceCreationFailed)
}

fn fetch_queues(
    handle: &ash::Device,
    plan: &QueueAllocationPlan,
) -> Vec<QueueHandle> {
    let mut queues = Vec::new();
    for entry in plan.entries() {
        for index in 0..entry.count {
            // SAFETY: The device was created requesting `count` queues
            // from this family, so every index below count exists.
            let raw =
                unsafe { handle.get_device_queue(entry.family_id, index) };
            queues.push(QueueHandle {
                queue: Arc::new(Mutex::new(raw)),
                family_id: entry.family_id,
                index_in_family: index,
                compute: entry.compute,
                transfer: entry.transfer,
            });
        }
    }
    queues
}

// Debug naming functionality
impl Device {
    /// Set a Vulkan debug name for an object owned by this device.
    ///
    /// Passing `None` as the name is treated as a no-op.
    ///
    /// # Safety
    /// `object` must be a valid Vulkan handle created from this device (or a
    /// child object associated with this device) and must remain valid for the
    /// duration of the call.
    pub unsafe fn set_object_name<H>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let Some(debug_utils) = self.debug_utils_device.as_ref() else {
            return Ok(());
        };

        let Some(name) = name else {
            return Ok(());
        };

        let object_name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);

        // SAFETY: Caller guarantees object provenance and validity.
        unsafe { debug_utils.set_debug_utils_object_name(&object_name_info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// Convenience helper to set a name from UTF-8 text.
    ///
    /// Passing `None` as the name is treated as a no-op.
    ///
    /// # Safety
    /// `object` must be a valid Vulkan handle created from this device (or a
    /// child object associated with this device) and must remain valid for the
    /// duration of the call.
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let name = match name {
            Some(name) => {
                Some(CString::new(name).map_err(NameObjectError::InvalidName)?)
            }
            None => None,
        };

        // SAFETY: This method shares the same safety contract as
        // set_object_name.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }
}

// Buffer and memory functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid and reference only objects derived from
    /// this device. All referenced pointers must remain valid for the
    /// duration of the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference `buffer`.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees buffer provenance and drop ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// Query memory requirements for a buffer.
    ///
    /// # Safety
    /// `buffer` must be a valid handle created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `allocate_info` must be valid and describe a memory type index
    /// supported by this device.
    pub unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        // SAFETY: Caller guarantees allocation info validity.
        unsafe { self.handle.allocate_memory(allocate_info, None) }
    }

    /// # Safety
    /// `memory` must be a valid handle created from this device and not yet
    /// freed. No object may still be bound to `memory` at free time.
    pub unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory provenance and drop ordering.
        unsafe { self.handle.free_memory(memory, None) };
    }

    /// # Safety
    /// `buffer` and `memory` must both be valid handles created from this
    /// device. `offset` must satisfy alignment/size requirements from
    /// `vkGetBufferMemoryRequirements`.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `memory` must be a valid allocation from this device. The mapped range
    /// (`offset`, `size`) must be within the allocation and obey host access
    /// synchronization requirements.
    pub unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        flags: vk::MemoryMapFlags,
    ) -> Result<*mut std::ffi::c_void, vk::Result> {
        // SAFETY: Caller guarantees mapping preconditions.
        unsafe { self.handle.map_memory(memory, offset, size, flags) }
    }

    /// # Safety
    /// Every range in `memory_ranges` must reference memory allocations from
    /// this device and satisfy Vulkan flush requirements.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.flush_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// Every range in `memory_ranges` must reference mapped memory
    /// allocations from this device.
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.invalidate_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// `memory` must currently be mapped on this device.
    pub unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory is currently mapped.
        unsafe { self.handle.unmap_memory(memory) };
    }
}

// Image functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid and reference only objects derived from
    /// this device.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// `image` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference `image`.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: Caller guarantees image provenance and drop ordering.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// Query memory requirements for an image.
    ///
    /// # Safety
    /// `image` must be a valid handle created from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees image validity.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` and `memory` must both be valid handles created from this
    /// device. `offset` must satisfy alignment/size requirements from
    /// `vkGetImageMemoryRequirements`.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }
}

// Command pool functionality
impl Device {
    /// # Safety
    /// `create_info` must have a valid `queue_family_index` for this device.
    /// All referenced pointers must remain valid for the duration of the call.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and queue
        // family provenance.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be a valid handle created from this device and not yet
    /// destroyed. All command buffers allocated from it must have finished
    /// execution and must not be referenced by any pending GPU work.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Caller guarantees pool provenance and drop ordering.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info.command_pool` must be a valid pool created from this
    /// device. `command_buffer_count` must be non-zero.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity and pool provenance.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// `command_buffer` must be in the initial or executable state and must
    /// not be pending execution. All pointers in `begin_info` must remain
    /// valid for the duration of the call.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer state and
        // begin_info validity.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer is in the recording state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending execution on the GPU. The pool it
    /// was allocated from must have been created with
    /// `RESET_COMMAND_BUFFER`.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer is not pending
        // and pool flag is set.
        unsafe { self.handle.reset_command_buffer(command_buffer, flags) }
    }

    /// Free command buffers back to their source pool, returning memory to the
    /// pool's internal allocator.
    ///
    /// A no-op when `command_buffers` is empty.
    ///
    /// # Safety
    /// - All handles in `command_buffers` must have been allocated from `pool`.
    /// - No buffer in `command_buffers` may be pending execution on the GPU.
    /// - The caller must externally synchronize access to `pool` (e.g. by
    ///   ensuring no other thread is allocating or resetting from it
    ///   concurrently).
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: Caller guarantees pool/buffer provenance, idle state, and
        // external synchronization on pool.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) }
    }
}

// Copy command functionality
impl Device {
    /// # Safety
    /// `command_buffer` must be in the recording state. `src_buffer` and
    /// `dst_buffer` must be valid handles created from this device. Regions
    /// must be valid, non-overlapping within each buffer, and within bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees command buffer state and copy region
        // validity.
        unsafe {
            self.handle.cmd_copy_buffer(
                command_buffer,
                src_buffer,
                dst_buffer,
                regions,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state. `src_buffer` and
    /// `dst_image` must be valid handles created from this device, and
    /// `dst_image` must be in `dst_image_layout`. Regions must be within
    /// bounds of both resources.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: Caller guarantees command buffer state, handle
        // provenance, layout, and region validity.
        unsafe {
            self.handle.cmd_copy_buffer_to_image(
                command_buffer,
                src_buffer,
                dst_image,
                dst_image_layout,
                regions,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state. `src_image` and
    /// `dst_buffer` must be valid handles created from this device, and
    /// `src_image` must be in `src_image_layout`. Regions must be within
    /// bounds of both resources.
    pub unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: Caller guarantees command buffer state, handle
        // provenance, layout, and region validity.
        unsafe {
            self.handle.cmd_copy_image_to_buffer(
                command_buffer,
                src_image,
                src_image_layout,
                dst_buffer,
                regions,
            )
        }
    }
}

// Fence functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid fence create info. All referenced pointers
    /// must remain valid for the duration of the call.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must be a valid handle created from this device and not yet
    /// destroyed. No GPU work may reference this fence at time of destruction.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees fence provenance and drop ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// All handles in `fences` must be valid fences created from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence handle validity.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// All handles in `fences` must be valid fences created from this device
    /// and must not be currently pending on any queue submission.
    pub unsafe fn reset_raw_fences(
        &self,
        fences: &[vk::Fence],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence handle validity and
        // non-pending state.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// Query whether a fence is signaled.
    ///
    /// Returns `Ok(true)` if signaled, `Ok(false)` if not yet signaled.
    ///
    /// # Safety
    /// `fence` must be a valid handle created from this device and not yet
    /// destroyed.
    pub unsafe fn get_raw_fence_status(
        &self,
        fence: vk::Fence,
    ) -> Result<bool, vk::Result> {
        // SAFETY: Caller guarantees fence provenance and validity.
        unsafe { self.handle.get_fence_status(fence) }
    }
}
