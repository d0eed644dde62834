//! Transfer command pools and command buffers.
//!
//! [`TransferCommandPool`] allocates individually-resettable primary
//! command buffers for one queue family and recycles their handles when
//! a [`TransferCommandBuffer`] is dropped, so repeated transfers do not
//! grow the pool. Recording here covers the three copy operations the
//! transfer engine needs; there is no dispatch or barrier surface.

use std::{
    marker::PhantomData,
    sync::{Arc, mpsc},
};

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

/// Shared ownership of the raw Vulkan pool handle.
///
/// Held via `Arc` by both [`TransferCommandPool`] and every
/// [`TransferCommandBuffer`] allocated from it. The Vulkan pool is not
/// destroyed until all of those `Arc` clones are dropped, which prevents a
/// command buffer from holding a handle into a destroyed pool.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: pool was created from parent and is being destroyed. This
        // runs only when both TransferCommandPool and every
        // TransferCommandBuffer allocated from it have been dropped.
        // vkDestroyCommandPool implicitly frees all allocated command buffers.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

/// An owned command pool that allocates individually-resettable
/// command buffers for one queue family.
///
/// The pool is created with `RESET_COMMAND_BUFFER`, allowing each
/// allocated command buffer to be reset individually before re-use.
///
/// `TransferCommandPool` is `!Sync`: it cannot be shared across threads.
/// The Vulkan spec requires external synchronization for pool-level
/// operations (`vkAllocateCommandBuffers`); by being `!Sync` this is
/// guaranteed structurally rather than with a mutex. If cross-thread
/// sharing is needed, synchronize at a higher level.
///
/// The underlying Vulkan pool is not destroyed until both this wrapper and
/// every [`TransferCommandBuffer`] allocated from it are dropped.
pub struct TransferCommandPool {
    shared: Arc<CommandPoolShared>,
    family_id: u32,
    /// Cloned into each newly allocated [`TransferCommandBuffer`] so that
    /// dropping a buffer sends its handle back for recycling.
    sender: mpsc::Sender<vk::CommandBuffer>,
    /// Receives handles returned by dropped [`TransferCommandBuffer`]s.
    /// Only drained by `acquire` on the pool-owning thread. `Receiver`
    /// is `!Sync`, making `TransferCommandPool` structurally `!Sync`
    /// regardless of the `PhantomData` below.
    receiver: mpsc::Receiver<vk::CommandBuffer>,
    /// Explicit `!Sync` marker documenting the design intent. Redundant with
    /// `Receiver` but kept for clarity.
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for TransferCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCommandPool")
            .field("pool", &self.shared.pool)
            .field("family_id", &self.family_id)
            .finish_non_exhaustive()
    }
}

impl TransferCommandPool {
    /// Create a resettable command pool for the given queue family.
    ///
    /// `name` is an optional debug label applied via `VK_EXT_debug_utils` when
    /// the extension is available. Naming failures are logged as warnings and
    /// do not cause the call to fail.
    pub fn new(
        device: &Arc<Device>,
        family_id: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family_id)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: create_info uses a valid queue family index for this device.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        // SAFETY: pool is a valid command pool created from device.
        let name_result = unsafe { device.set_object_name_str(pool, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name command pool {:?}: {e}", pool);
        }

        let (sender, receiver) = mpsc::channel();

        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            family_id,
            sender,
            receiver,
            _not_sync: PhantomData,
        })
    }

    /// Acquire a primary command buffer from this pool.
    ///
    /// All handles that were returned to the pool's channel (by previously
    /// dropped [`TransferCommandBuffer`]s) are drained. One is recycled for
    /// the caller; any surplus handles are freed via `vkFreeCommandBuffers` to
    /// return their memory to the pool's allocator and bound peak usage. If no
    /// returned handles are available a new buffer is allocated from Vulkan.
    ///
    /// In all cases the returned buffer may not be in the initial state;
    /// [`begin_one_time`](TransferCommandBuffer::begin_one_time) resets it
    /// before recording.
    pub fn acquire(
        &self,
    ) -> Result<TransferCommandBuffer, AllocateCommandBufferError> {
        // Drain all returned handles. Recycle one; free the rest to return
        // their memory to the pool's allocator and prevent runaway growth.
        let mut returned: Vec<vk::CommandBuffer> =
            std::iter::from_fn(|| self.receiver.try_recv().ok()).collect();

        let handle = if let Some(recycled) = returned.pop() {
            if !returned.is_empty() {
                // SAFETY: All handles in `returned` were allocated from
                // self.shared.pool. The drop→send contract requires callers
                // not to drop a TransferCommandBuffer while its GPU work is
                // still executing, so every handle here is idle. External
                // synchronization on the pool is guaranteed by
                // TransferCommandPool being !Sync — only the owning thread
                // can reach this call site.
                unsafe {
                    self.shared
                        .parent
                        .free_raw_command_buffers(self.shared.pool, &returned)
                };
            }
            recycled
        } else {
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.shared.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            // SAFETY: allocate_info references a valid pool created from
            // parent. TransferCommandPool is !Sync so no concurrent pool
            // access is possible.
            unsafe {
                self.shared
                    .parent
                    .allocate_raw_command_buffers(&allocate_info)
            }
            .map(|mut bufs| {
                debug_assert_eq!(bufs.len(), 1);
                bufs.remove(0)
            })
            .map_err(AllocateCommandBufferError::Vulkan)?
        };

        Ok(TransferCommandBuffer {
            _pool: Arc::clone(&self.shared),
            parent: Arc::clone(&self.shared.parent),
            handle,
            return_sender: self.sender.clone(),
        })
    }

    pub fn family_id(&self) -> u32 {
        self.family_id
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.shared.pool
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.shared.parent
    }
}

/// A primary command buffer acquired from a [`TransferCommandPool`].
///
/// All recording operations are `unsafe`; the caller is responsible for
/// correct Vulkan state sequencing.
///
/// On drop, the raw handle is sent back to the pool's return channel for
/// recycling. If the pool has already been dropped the send is silently
/// discarded; `vkDestroyCommandPool` handles cleanup via [`CommandPoolShared`].
pub struct TransferCommandBuffer {
    /// Keeps the pool alive until this buffer is dropped.
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    /// Returns the handle to the pool's channel on drop.
    return_sender: mpsc::Sender<vk::CommandBuffer>,
}

impl Drop for TransferCommandBuffer {
    fn drop(&mut self) {
        // Send the handle back for recycling. If the receiver (pool) has been
        // dropped the error is intentionally ignored — the handle will be freed
        // implicitly when CommandPoolShared (and its
        // vkDestroyCommandPool) runs.
        let _ = self.return_sender.send(self.handle);
    }
}

impl std::fmt::Debug for TransferCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCommandBuffer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl TransferCommandBuffer {
    /// Reset and begin recording with `ONE_TIME_SUBMIT`.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn begin_one_time(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is not pending.
        unsafe {
            self.parent.reset_raw_command_buffer(
                self.handle,
                vk::CommandBufferResetFlags::empty(),
            )
        }?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: The buffer was reset to the initial state just above.
        unsafe {
            self.parent
                .begin_raw_command_buffer(self.handle, &begin_info)
        }
    }

    /// End recording.
    ///
    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is in the recording state.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
    }

    /// Record a buffer-to-buffer copy.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `src_buffer` and
    /// `dst_buffer` must be valid handles created from the same device as
    /// this command buffer. Regions must be valid and in-bounds.
    pub unsafe fn record_copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees recording state and copy validity.
        unsafe {
            self.parent.cmd_copy_buffer(
                self.handle,
                src_buffer,
                dst_buffer,
                regions,
            )
        }
    }

    /// Record a buffer-to-image copy.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `src_buffer` and
    /// `dst_image` must be valid handles created from the same device as
    /// this command buffer, `dst_image` must be in `dst_image_layout`,
    /// and regions must be in-bounds.
    pub unsafe fn record_copy_buffer_to_image(
        &mut self,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: Caller guarantees recording state, layout, and
        // region validity.
        unsafe {
            self.parent.cmd_copy_buffer_to_image(
                self.handle,
                src_buffer,
                dst_image,
                dst_image_layout,
                regions,
            )
        }
    }

    /// Record an image-to-buffer copy.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `src_image` and
    /// `dst_buffer` must be valid handles created from the same device as
    /// this command buffer, `src_image` must be in `src_image_layout`,
    /// and regions must be in-bounds.
    pub unsafe fn record_copy_image_to_buffer(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: Caller guarantees recording state, layout, and
        // region validity.
        unsafe {
            self.parent.cmd_copy_image_to_buffer(
                self.handle,
                src_image,
                src_image_layout,
                dst_buffer,
                regions,
            )
        }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

// Verified at compile time: both types are Send.
// TransferCommandPool: Send + !Sync (Receiver/Sender/PhantomData<Cell<()>>)
// TransferCommandBuffer: Send + !Sync (Sender<T>: !Sync)
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for TransferCommandPool {}
impl AssertSend for TransferCommandBuffer {}
