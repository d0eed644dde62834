//! Synchronous copies between buffers and images.
//!
//! [`TransferEngine`] owns one transfer-capable queue handle, a
//! [`TransferCommandPool`] on that queue's family, and a [`Fence`]. Each
//! copy records a fresh one-time command buffer, submits it signaling
//! the fence, and blocks until the fence fires, so by the time a call
//! returns the destination is fully written. That makes every copy a
//! full round trip; batch data into fewer, larger copies rather than
//! issuing many small ones.
//!
//! The engine is `!Sync` (it contains the pool); one engine per thread.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::DeviceBuffer;
use crate::command::{
    AllocateCommandBufferError, CreateCommandPoolError, TransferCommandPool,
};
use crate::device::{Device, QueueHandle, QueueIndexOutOfRange};
use crate::image::DeviceImage;
use crate::sync::{
    CreateFenceError, Fence, MarkSubmittedError, WaitFenceError,
};

#[derive(Debug, Error)]
pub enum CreateTransferEngineError {
    #[error(transparent)]
    NoTransferQueue(#[from] QueueIndexOutOfRange),

    #[error(transparent)]
    CreatePool(#[from] CreateCommandPoolError),

    #[error(transparent)]
    CreateFence(#[from] CreateFenceError),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(
        "Copy region out of bounds: src(size={src_size}, offset={src_offset}), \
         dst(size={dst_size}, offset={dst_offset}), copy={copy_size}"
    )]
    RegionOutOfBounds {
        src_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_size: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    },

    #[error(transparent)]
    Acquire(#[from] AllocateCommandBufferError),

    #[error("Vulkan error beginning transfer command buffer: {0}")]
    Begin(vk::Result),

    #[error("Vulkan error ending transfer command buffer: {0}")]
    End(vk::Result),

    #[error("Vulkan error submitting transfer: {0}")]
    Submit(vk::Result),

    #[error(transparent)]
    FenceState(#[from] MarkSubmittedError),

    #[error("Failed waiting for transfer fence: {0}")]
    Wait(#[from] WaitFenceError),
}

/// Bounds-check a buffer-to-buffer copy region.
///
/// Offsets plus the copy size must stay inside both buffers; the
/// additions saturate so sizes near `u64::MAX` cannot wrap past the
/// check.
pub fn check_copy_region(
    src_size: vk::DeviceSize,
    dst_size: vk::DeviceSize,
    copy_size: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
) -> Result<(), TransferError> {
    if src_offset.saturating_add(copy_size) > src_size
        || dst_offset.saturating_add(copy_size) > dst_size
    {
        return Err(TransferError::RegionOutOfBounds {
            src_size,
            src_offset,
            dst_size,
            dst_offset,
            copy_size,
        });
    }
    Ok(())
}

/// Records, submits, and waits out copy commands on one transfer queue.
///
/// The engine reuses one fence across copies; submitting and waiting
/// take `&mut self` so the fence can only ever track one submission.
pub struct TransferEngine {
    device: Arc<Device>,
    queue: QueueHandle,
    pool: TransferCommandPool,
    fence: Fence,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("queue_family", &self.queue.family_id())
            .field("pool", &self.pool)
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// Create an engine on the device's first transfer-capable queue.
    pub fn new(
        device: &Arc<Device>,
    ) -> Result<Self, CreateTransferEngineError> {
        let queue = device.transfer_queue()?.clone();
        Self::on_queue(device, queue)
    }

    /// Create an engine on a specific transfer-capable queue, for
    /// callers spreading streams across queues.
    pub fn on_queue(
        device: &Arc<Device>,
        queue: QueueHandle,
    ) -> Result<Self, CreateTransferEngineError> {
        let pool = TransferCommandPool::new(
            device,
            queue.family_id(),
            Some("transfer-engine pool"),
        )?;
        let fence = Fence::new(device, false, Some("transfer-engine fence"))?;
        Ok(Self {
            device: Arc::clone(device),
            queue,
            pool,
            fence,
        })
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Copy `copy_size` bytes from `src` to `dst`. Blocks until the
    /// copy has completed on the device.
    ///
    /// The copy is bounds-checked against both buffers before any
    /// recording happens; a zero-sized copy is a no-op that never
    /// touches the queue.
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        copy_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
    ) -> Result<(), TransferError> {
        check_copy_region(
            src.size(),
            dst.size(),
            copy_size,
            src_offset,
            dst_offset,
        )?;
        if copy_size == 0 {
            return Ok(());
        }

        let mut cmd = self.pool.acquire()?;
        // SAFETY: The buffer came back through the pool's recycle
        // channel, and every submission in this engine is waited out
        // before returning, so it cannot be pending.
        unsafe { cmd.begin_one_time() }.map_err(TransferError::Begin)?;

        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(copy_size);
        // SAFETY: cmd is recording; both buffers are live handles from
        // this device and the region was bounds-checked above.
        unsafe {
            cmd.record_copy_buffer(
                src.raw_buffer(),
                dst.raw_buffer(),
                std::slice::from_ref(&region),
            )
        };
        self.submit_and_wait(cmd)
    }

    /// Copy tightly-packed texels from `src` into the whole of `dst`,
    /// starting at `buffer_offset` bytes. Blocks until the copy has
    /// completed on the device.
    ///
    /// # Safety
    /// `dst` must be in `TRANSFER_DST_OPTIMAL` layout, `src` must hold
    /// at least one full image of texel data at `buffer_offset`, and
    /// neither resource may be in use on another queue.
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        src: &DeviceBuffer,
        dst: &DeviceImage,
        buffer_offset: vk::DeviceSize,
    ) -> Result<(), TransferError> {
        let mut cmd = self.pool.acquire()?;
        // SAFETY: Recycled buffers in this engine are never pending
        // (every submission is waited out).
        unsafe { cmd.begin_one_time() }.map_err(TransferError::Begin)?;

        let region = full_image_region(dst, buffer_offset);
        // SAFETY: cmd is recording; the caller guarantees layout and
        // data extent.
        unsafe {
            cmd.record_copy_buffer_to_image(
                src.raw_buffer(),
                dst.raw_image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            )
        };
        self.submit_and_wait(cmd)
    }

    /// Copy the whole of `src` into `dst` as tightly-packed texels,
    /// starting at `buffer_offset` bytes. Blocks until the copy has
    /// completed on the device.
    ///
    /// # Safety
    /// `src` must be in `TRANSFER_SRC_OPTIMAL` layout, `dst` must have
    /// room for one full image of texel data at `buffer_offset`, and
    /// neither resource may be in use on another queue.
    pub unsafe fn copy_image_to_buffer(
        &mut self,
        src: &DeviceImage,
        dst: &DeviceBuffer,
        buffer_offset: vk::DeviceSize,
    ) -> Result<(), TransferError> {
        let mut cmd = self.pool.acquire()?;
        // SAFETY: Recycled buffers in this engine are never pending
        // (every submission is waited out).
        unsafe { cmd.begin_one_time() }.map_err(TransferError::Begin)?;

        let region = full_image_region(src, buffer_offset);
        // SAFETY: cmd is recording; the caller guarantees layout and
        // buffer capacity.
        unsafe {
            cmd.record_copy_image_to_buffer(
                src.raw_image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.raw_buffer(),
                std::slice::from_ref(&region),
            )
        };
        self.submit_and_wait(cmd)
    }

    fn submit_and_wait(
        &mut self,
        mut cmd: crate::command::TransferCommandBuffer,
    ) -> Result<(), TransferError> {
        // SAFETY: cmd is in the recording state (begun by the caller of
        // this helper, with copies recorded since).
        unsafe { cmd.end() }.map_err(TransferError::End)?;

        let raw_cmd = cmd.raw_command_buffer();
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(std::slice::from_ref(&raw_cmd));
        // SAFETY: queue and fence belong to this device; the command
        // buffer is executable; the fence is in the ready state because
        // every submission below waits it out and resets it.
        unsafe {
            self.device.queue_submit(
                &self.queue,
                std::slice::from_ref(&submit_info),
                self.fence.raw_fence(),
            )
        }
        .map_err(TransferError::Submit)?;

        // SAFETY: the submission above signals the fence on completion.
        unsafe { self.fence.mark_submitted() }?;
        // SAFETY: &mut self holds the only path to this fence's handle,
        // so nothing can re-submit it between the wait and the reset.
        unsafe { self.fence.wait_and_reset(u64::MAX) }?;
        // cmd drops here, returning its handle to the pool only after
        // the fence proved its submission complete.
        Ok(())
    }
}

/// A copy region covering the whole image with tightly-packed rows
/// (`buffer_row_length` 0).
fn full_image_region(
    image: &DeviceImage,
    buffer_offset: vk::DeviceSize,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(buffer_offset)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1),
        )
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D {
            width: image.extent().width,
            height: image.extent().height,
            depth: 1,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_within_both_buffers_passes() {
        assert!(check_copy_region(1024, 1024, 512, 256, 512).is_ok());
        assert!(check_copy_region(1024, 1024, 1024, 0, 0).is_ok());
    }

    #[test]
    fn region_past_source_end_fails() {
        let err = check_copy_region(1024, 4096, 512, 768, 0).unwrap_err();
        match err {
            TransferError::RegionOutOfBounds {
                src_size,
                src_offset,
                copy_size,
                ..
            } => {
                assert_eq!(src_size, 1024);
                assert_eq!(src_offset, 768);
                assert_eq!(copy_size, 512);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn region_past_destination_end_fails() {
        assert!(check_copy_region(4096, 1024, 512, 0, 768).is_err());
    }

    #[test]
    fn huge_offsets_do_not_wrap_around() {
        assert!(
            check_copy_region(1024, 1024, u64::MAX, 2, 0).is_err()
        );
        assert!(
            check_copy_region(1024, 1024, 2, u64::MAX, 0).is_err()
        );
    }

    #[test]
    fn zero_sized_copy_at_end_is_in_bounds() {
        assert!(check_copy_region(1024, 1024, 0, 1024, 1024).is_ok());
    }
}
