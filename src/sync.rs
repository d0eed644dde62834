//! CPU–GPU synchronisation: [`Fence`].
//!
//! A fence tracks one submission at a time. On top of the Vulkan
//! signaled/unsignaled bit, the wrapper keeps a host-side submitted
//! flag so the two classic misuses are caught before they reach the
//! driver: waiting on a fence that was never attached to a submission,
//! and attaching one fence to two submissions without a reset in
//! between. [`TransferEngine`](crate::transfer::TransferEngine) drives
//! a fence through this cycle for every copy it submits.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
    #[error("Asked to wait for fence but fence was never marked as submitted")]
    NotSubmitted,
}

#[derive(Debug, Error)]
pub enum MarkSubmittedError {
    #[error("Fence is already tracking a submission")]
    AlreadySubmitted,
}

/// An owned binary fence used for CPU–GPU synchronisation.
///
/// The cycle is: pass [`raw_fence`](Self::raw_fence) to a submission,
/// [`mark_submitted`](Self::mark_submitted), then
/// [`wait_and_reset`](Self::wait_and_reset) to block until the device
/// signals it and make it ready for the next submission.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    submitted: bool,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("submitted", &self.submitted)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence.
    ///
    /// `signaled` controls the initial Vulkan state; a signaled fence
    /// starts out tracked as submitted so the first wait-and-reset
    /// cycle returns immediately.
    ///
    /// `name` is an optional debug label applied via `VK_EXT_debug_utils`
    /// when the extension is available; naming failures are logged as
    /// warnings and do not fail the call.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let mut create_info = vk::FenceCreateInfo::default();
        if signaled {
            create_info = create_info.flags(vk::FenceCreateFlags::SIGNALED);
        }
        // SAFETY: create_info holds no pointers, only flags.
        let handle = unsafe { device.create_raw_fence(&create_info) }
            .map_err(CreateFenceError::Vulkan)?;

        // SAFETY: handle was created from device just above.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name fence {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            submitted: signaled,
        })
    }

    /// Poll the fence: `Ok(true)` if signaled, `Ok(false)` if still
    /// pending.
    pub fn wait_nonblocking(&self) -> Result<bool, WaitFenceError> {
        if !self.submitted {
            return Err(WaitFenceError::NotSubmitted);
        }
        // SAFETY: handle is a live fence owned by this wrapper.
        unsafe { self.parent.get_raw_fence_status(self.handle) }
            .map_err(WaitFenceError::Vulkan)
    }

    /// Block until the fence is signaled or `timeout_ns` nanoseconds
    /// elapse.
    ///
    /// Pass `u64::MAX` to wait indefinitely. Fails with
    /// [`WaitFenceError::NotSubmitted`] when nothing was ever submitted
    /// against the fence, since that wait could never return.
    pub fn wait(&self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        if !self.submitted {
            return Err(WaitFenceError::NotSubmitted);
        }
        // SAFETY: handle is a live fence owned by this wrapper.
        match unsafe {
            self.parent
                .wait_for_raw_fences(&[self.handle], true, timeout_ns)
        } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(WaitFenceError::Timeout),
            Err(e) => Err(WaitFenceError::Vulkan(e)),
        }
    }

    /// Reset the fence to the unsignaled state.
    ///
    /// # Safety
    /// The fence must not be currently pending on any queue submission:
    /// the GPU must already have signaled it, or it was never submitted.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        debug_assert!(self.submitted);
        // SAFETY: Caller guarantees the fence is not pending.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }?;
        self.submitted = false;
        Ok(())
    }

    /// Wait for the fence to be signaled and then immediately reset it.
    ///
    /// # Safety
    /// No other thread may re-submit this fence's raw handle between the
    /// wait returning and the reset completing. The `&mut` receiver
    /// prevents same-thread re-submission via `raw_fence`, but raw-handle
    /// usage from other threads is the caller's responsibility.
    pub unsafe fn wait_and_reset(
        &mut self,
        timeout_ns: u64,
    ) -> Result<(), WaitFenceError> {
        self.wait(timeout_ns)?;
        // SAFETY: wait() succeeded so the fence is signaled, not pending,
        // and &mut self blocks same-thread re-submission in between.
        unsafe { self.reset() }.map_err(WaitFenceError::Vulkan)
    }

    /// Record that the fence's raw handle was handed to a submission.
    ///
    /// # Safety
    /// Some operation that will signal the fence on completion (such as
    /// vkQueueSubmit) must actually have been given the handle; waiting
    /// on a fence marked submitted without one never returns.
    pub unsafe fn mark_submitted(&mut self) -> Result<(), MarkSubmittedError> {
        if self.submitted {
            return Err(MarkSubmittedError::AlreadySubmitted);
        }
        self.submitted = true;
        Ok(())
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Unsignaled and safe to hand to a new submission.
    pub fn is_ready(&self) -> bool {
        !self.submitted
    }

    /// Attached to a submission and waitable.
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: handle is owned by this wrapper; no GPU work may still
        // reference it at teardown.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}
