//! Device images for buffer/image transfer round trips.
//!
//! [`DeviceImage`] is a 2-D optimal-tiling image bound to its own
//! memory allocation. Images here exist as transfer endpoints and
//! storage images for compute; there is no view, sampler, or render
//! machinery. Layout transitions are the caller's business, the image
//! starts in `UNDEFINED`.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateImageError {
    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),

    #[error(transparent)]
    NoSuitableMemory(#[from] crate::physical::NoSuitableMemoryFound),

    #[error("Vulkan error allocating image memory: {0}")]
    AllocateMemory(vk::Result),

    #[error("Vulkan error binding image memory: {0}")]
    BindMemory(vk::Result),
}

/// A 2-D optimal-tiling image with its own device memory allocation.
pub struct DeviceImage {
    parent: Arc<Device>,
    handle: vk::Image,
    memory: vk::DeviceMemory,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl std::fmt::Debug for DeviceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceImage")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl DeviceImage {
    /// Create an image of `extent`x`format` with storage and transfer
    /// usage. Memory prefers `DEVICE_LOCAL`, falling back to any type
    /// the image's requirements allow (integrated hardware sometimes
    /// reports optimal-tiling types without the flag).
    pub fn new(
        device: &Arc<Device>,
        extent: vk::Extent2D,
        format: vk::Format,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_image(&create_info) }
            .map_err(CreateImageError::CreateImage)?;

        // SAFETY: handle is a valid image created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name image {:?}: {e}", handle);
        }

        // SAFETY: handle is a valid image created from this device.
        let reqs = unsafe { device.get_raw_image_memory_requirements(handle) };

        let memory_type_index = device
            .memory_types()
            .select_masked(
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                reqs.memory_type_bits,
            )
            .or_else(|_| {
                device.memory_types().select_masked(
                    vk::MemoryPropertyFlags::empty(),
                    reqs.memory_type_bits,
                )
            });
        let memory_type_index = match memory_type_index {
            Ok(idx) => idx,
            Err(e) => {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { device.destroy_raw_image(handle) };
                return Err(e.into());
            }
        };

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(reqs.size)
            .memory_type_index(memory_type_index);
        // SAFETY: the type index was selected from this device's memory
        // table, masked by the image's requirements.
        let memory = match unsafe { device.allocate_raw_memory(&allocate_info) }
        {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { device.destroy_raw_image(handle) };
                return Err(CreateImageError::AllocateMemory(e));
            }
        };

        // SAFETY: handle and memory are valid and belong to this device;
        // offset 0 trivially satisfies the alignment requirement.
        let bind_result =
            unsafe { device.bind_raw_image_memory(handle, memory, 0) };
        if let Err(e) = bind_result {
            // SAFETY: memory was just allocated and nothing is bound to it.
            unsafe { device.free_raw_memory(memory) };
            // SAFETY: handle is valid and owned by this scope.
            unsafe { device.destroy_raw_image(handle) };
            return Err(CreateImageError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            memory,
            extent,
            format,
        })
    }

    pub fn raw_image(&self) -> vk::Image {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        tracing::debug!("Dropping image {:?}", self.handle);
        // SAFETY: memory and handle were created from parent and are
        // owned by this wrapper.
        unsafe {
            self.parent.free_raw_memory(self.memory);
            self.parent.destroy_raw_image(self.handle);
        }
    }
}
