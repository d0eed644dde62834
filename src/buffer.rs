//! Storage buffers and host-mapped views.
//!
//! [`DeviceBuffer`] is the workhorse resource: a `VkBuffer` bound to a
//! dedicated `VkDeviceMemory` allocation chosen through the device's
//! [`MemoryTypeTable`](crate::physical::MemoryTypeTable). Every buffer
//! carries `STORAGE_BUFFER` usage so it can always be bound to a
//! compute pipeline; callers OR in transfer or uniform usage as needed.
//!
//! The flags a buffer was *requested* with and the flags of the memory
//! type it actually *landed* on are both recorded, because a request
//! for `HOST_VISIBLE` may be satisfied by a type with extra properties
//! (coherent, cached) and downstream decisions key off the actuals.
//!
//! Host access goes through [`map`](DeviceBuffer::map), which returns a
//! [`MappedView`] borrowing the buffer mutably, so the borrow checker
//! enforces at most one outstanding view.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use thiserror::Error;

use crate::device::Device;
use crate::physical::NoSuitableMemoryFound;

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error(transparent)]
    NoSuitableMemory(#[from] NoSuitableMemoryFound),

    #[error("Vulkan error allocating buffer memory: {0}")]
    AllocateMemory(vk::Result),

    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum MapBufferError {
    #[error("Buffer memory is not host visible")]
    NotHostVisible,

    #[error("Cannot map a buffer as a zero-sized element type")]
    ZeroSizedElement,

    #[error("Vulkan error mapping buffer memory: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WriteBufferError {
    #[error(
        "Data size ({data_bytes} bytes) exceeds buffer size ({buffer_bytes} bytes)"
    )]
    DataTooLarge {
        data_bytes: usize,
        buffer_bytes: vk::DeviceSize,
    },

    #[error(transparent)]
    Map(#[from] MapBufferError),
}

/// A storage buffer with its own device memory allocation.
///
/// The allocation is bound at offset 0 and freed on drop, memory
/// before buffer. Holds an `Arc<Device>` so the device outlives it.
pub struct DeviceBuffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    requested_flags: vk::MemoryPropertyFlags,
    actual_flags: vk::MemoryPropertyFlags,
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("actual_flags", &self.actual_flags)
            .finish_non_exhaustive()
    }
}

impl DeviceBuffer {
    /// Create a buffer of `size` bytes backed by the lowest-indexed
    /// memory type whose properties cover `properties` and which is
    /// allowed by the buffer's memory requirements.
    ///
    /// `usage` is ORed with `STORAGE_BUFFER`. `size` of zero is valid
    /// at this layer in name only; Vulkan rejects it, so callers get
    /// the driver's error back rather than a silent clamp.
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        properties: vk::MemoryPropertyFlags,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage | vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;

        // SAFETY: handle is a valid buffer created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name buffer {:?}: {e}", handle);
        }

        // SAFETY: handle is a valid buffer created from this device.
        let reqs = unsafe { device.get_raw_buffer_memory_requirements(handle) };

        let memory_type_index = match device
            .memory_types()
            .select_masked(properties, reqs.memory_type_bits)
        {
            Ok(idx) => idx,
            Err(e) => {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { device.destroy_raw_buffer(handle) };
                return Err(e.into());
            }
        };
        let actual_flags = device.memory_types().flags_of(memory_type_index);

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(memory_type_index);
        // SAFETY: allocate_info uses a type index selected from this
        // device's memory table, masked by the buffer's requirements.
        let memory = match unsafe { device.allocate_raw_memory(&allocate_info) }
        {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { device.destroy_raw_buffer(handle) };
                return Err(CreateBufferError::AllocateMemory(e));
            }
        };

        // SAFETY: handle and memory are valid and belong to this device;
        // offset 0 trivially satisfies the alignment requirement.
        let bind_result =
            unsafe { device.bind_raw_buffer_memory(handle, memory, 0) };
        if let Err(e) = bind_result {
            // SAFETY: memory was just allocated and nothing is bound to it.
            unsafe { device.free_raw_memory(memory) };
            // SAFETY: handle is valid and owned by this scope.
            unsafe { device.destroy_raw_buffer(handle) };
            return Err(CreateBufferError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            memory,
            size,
            memory_type_index,
            requested_flags: properties,
            actual_flags,
        })
    }

    /// A buffer on `HOST_VISIBLE` memory, mappable with
    /// [`map`](Self::map). Transfer usage in both directions is
    /// included so it can stage copies.
    pub fn host_visible(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Self::new(
            device,
            size,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            name,
        )
    }

    /// A buffer on `DEVICE_LOCAL` memory with transfer usage in both
    /// directions. On unified-memory hardware this may land on a type
    /// that is also host visible; check [`host_visible`](Self::is_host_visible).
    pub fn device_local(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Self::new(
            device,
            size,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            name,
        )
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Byte offset of the buffer within its allocation. Always 0 since
    /// each buffer owns its allocation; exists so descriptor code does
    /// not hardcode the assumption.
    pub fn offset_bytes(&self) -> vk::DeviceSize {
        0
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// The properties the buffer was requested with.
    pub fn requested_flags(&self) -> vk::MemoryPropertyFlags {
        self.requested_flags
    }

    /// The properties of the memory type the buffer landed on.
    pub fn actual_flags(&self) -> vk::MemoryPropertyFlags {
        self.actual_flags
    }

    pub fn is_host_visible(&self) -> bool {
        self.actual_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Map the whole buffer as a slice of `T`.
    ///
    /// The exclusive borrow keeps at most one view alive at a time.
    /// Non-coherent memory is invalidated on map so reads observe
    /// device writes, and flushed on unmap so the device observes host
    /// writes. The view covers `size / size_of::<T>()` elements; any
    /// tail shorter than one element is not exposed.
    pub fn map<T: Pod>(
        &mut self,
    ) -> Result<MappedView<'_, T>, MapBufferError> {
        if size_of::<T>() == 0 {
            return Err(MapBufferError::ZeroSizedElement);
        }
        if !self.is_host_visible() {
            return Err(MapBufferError::NotHostVisible);
        }

        let coherent = self
            .actual_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        // SAFETY: memory is a live HOST_VISIBLE allocation from parent
        // and nothing else has it mapped (the &mut borrow is exclusive).
        let ptr = unsafe {
            self.parent.map_raw_memory(
                self.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(MapBufferError::Vulkan)?;

        if !coherent {
            let range = vk::MappedMemoryRange::default()
                .memory(self.memory)
                .offset(0)
                .size(vk::WHOLE_SIZE);
            // SAFETY: the range references memory mapped just above.
            let invalidate_result = unsafe {
                self.parent.invalidate_raw_mapped_memory_ranges(
                    std::slice::from_ref(&range),
                )
            };
            if let Err(e) = invalidate_result {
                // SAFETY: memory was mapped just above.
                unsafe { self.parent.unmap_raw_memory(self.memory) };
                return Err(MapBufferError::Vulkan(e));
            }
        }

        let len = (self.size / size_of::<T>() as vk::DeviceSize) as usize;
        Ok(MappedView {
            buffer: self,
            ptr: ptr.cast::<T>(),
            len,
            coherent,
            unmapped: false,
        })
    }

    /// Map, copy `data` in from element 0, unmap.
    pub fn write_pod<T: Pod>(
        &mut self,
        data: &[T],
    ) -> Result<(), WriteBufferError> {
        let data_bytes = std::mem::size_of_val(data);
        if data_bytes as vk::DeviceSize > self.size {
            return Err(WriteBufferError::DataTooLarge {
                data_bytes,
                buffer_bytes: self.size,
            });
        }
        let mut view = self.map::<T>()?;
        view[..data.len()].copy_from_slice(data);
        view.release().map_err(MapBufferError::Vulkan)?;
        Ok(())
    }

    /// Map, copy all whole elements out, unmap.
    pub fn read_pod<T: Pod>(&mut self) -> Result<Vec<T>, MapBufferError> {
        let view = self.map::<T>()?;
        let out = view.to_vec();
        view.release().map_err(MapBufferError::Vulkan)?;
        Ok(out)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        // SAFETY: memory and handle were created from parent and are
        // owned by this wrapper; no view can outlive us.
        unsafe {
            self.parent.free_raw_memory(self.memory);
            self.parent.destroy_raw_buffer(self.handle);
        }
    }
}

/// A host-mapped slice view into a [`DeviceBuffer`].
///
/// Derefs to `[T]`. Unmaps exactly once, either on drop (flush errors
/// are logged and swallowed) or through [`release`](Self::release)
/// (flush errors are returned).
pub struct MappedView<'a, T: Pod> {
    buffer: &'a mut DeviceBuffer,
    ptr: *mut T,
    len: usize,
    coherent: bool,
    unmapped: bool,
}

impl<T: Pod> MappedView<'_, T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> vk::DeviceSize {
        (self.len * size_of::<T>()) as vk::DeviceSize
    }

    /// Flush (when non-coherent) and unmap, surfacing the flush error.
    pub fn release(mut self) -> Result<(), vk::Result> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), vk::Result> {
        if self.unmapped {
            return Ok(());
        }
        self.unmapped = true;

        let flush_result = if self.coherent {
            Ok(())
        } else {
            let range = vk::MappedMemoryRange::default()
                .memory(self.buffer.memory)
                .offset(0)
                .size(vk::WHOLE_SIZE);
            // SAFETY: the range references this view's still-mapped
            // memory.
            unsafe {
                self.buffer.parent.flush_raw_mapped_memory_ranges(
                    std::slice::from_ref(&range),
                )
            }
        };
        // SAFETY: memory was mapped when the view was created and this
        // is the single unmap (guarded by self.unmapped).
        unsafe { self.buffer.parent.unmap_raw_memory(self.buffer.memory) };
        flush_result
    }
}

impl<T: Pod> std::ops::Deref for MappedView<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: ptr points at a mapped region of at least len
        // elements; Pod guarantees any bit pattern is valid.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T: Pod> std::ops::DerefMut for MappedView<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: ptr points at a mapped region of at least len
        // elements and the view borrows the buffer exclusively.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T: Pod> Drop for MappedView<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(
                "Failed to flush mapped buffer {:?} on unmap: {e}",
                self.buffer.handle
            );
        }
    }
}
