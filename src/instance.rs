//! Vulkan instance creation and physical device enumeration.
//!
//! The central type is [`Instance`], which wraps an `ash::Instance` and
//! owns the entry-point loader plus an optional debug messenger. Layer
//! and extension requests pass through the negotiation in
//! [`crate::capability`] before the instance is created, so the set of
//! names actually enabled is recorded on the instance and queryable
//! afterwards.
//!
//! [`VkVersion`] is a thin newtype over the packed Vulkan version word.

use ash::vk;
use thiserror::Error;

use crate::capability::{
    self, CapabilityMissing, CapabilityRequest, DiagnosticSink, TracingSink,
};
use crate::physical::PhysicalDevice;
use std::{
    ffi::{CStr, CString},
    fmt::Debug,
    str::FromStr,
    sync::Arc,
};

/// Minimum severity level for Vulkan validation layer messages.
///
/// Passed to [`Instance::new`] as `max_log_level`. Messages at or
/// above the chosen level are forwarded to the [`tracing`] subscriber;
/// lower-severity messages are suppressed. Variants are ordered
/// least-to-most severe: `Verbose < Info < Warning < Error`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

/// A packed Vulkan API version number.
///
/// Wraps the 32-bit encoding used by `VkApplicationInfo` and
/// `vkEnumerateInstanceVersion`. Construct from components with
/// [`new`](Self::new), or wrap an already-encoded word with
/// [`from_raw`](Self::from_raw).
#[derive(Debug, Clone, Copy)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }
    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }
    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    pub fn to_tuple(&self) -> (u32, u32, u32, u32) {
        (self.variant(), self.major(), self.minor(), self.patch())
    }

    pub fn from_tuple(tuple: (u32, u32, u32, u32)) -> Self {
        Self::new(tuple.0, tuple.1, tuple.2, tuple.3)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

/// The root Vulkan object.
///
/// Owns the `ash::Entry` loader, the `ash::Instance` handle, and an
/// optional debug messenger. All objects derived from an instance hold
/// an `Arc<Instance>` to keep it alive.
///
/// Construct via [`Instance::new`] or [`Instance::for_compute`], both
/// `unsafe` because they load a Vulkan shared library through
/// `libloading`.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    layers: Vec<CString>,
    extensions: Vec<CString>,
    ver: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error(transparent)]
    MissingCapability(#[from] CapabilityMissing),
    #[error("Unknown Vulkan Error {0}")]
    UnknownVulkan(vk::Result),
    #[error("Invalid app name was passed to Instance::new")]
    InvalidAppName,
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((debug_messenger, debug_utils_instance)) =
            self.debug_messenger.take()
        {
            //SAFETY: last use of this debug messenger. We made this debug
            //messenger from this instance. debug_utils_instance is derived from
            //this instance
            unsafe {
                debug_utils_instance
                    .destroy_debug_utils_messenger(debug_messenger, None)
            };
        }
        //SAFETY: We are in drop so this is the last use of instance. Any given
        //derived object should be gone
        unsafe { self.handle.destroy_instance(None) };
    }
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::UnknownVulkan(value)
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    //SAFETY: Vulkan guarantees p_callback_data is valid
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }
        .to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(
                target: "rcompute-debug-messenger",
                "[{}] {}",
                type_str,
                message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(
                target: "rcompute-debug-messenger",
                "[{}] {}",
                type_str,
                message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(
                target: "rcompute-debug-messenger",
                "[{}] {}",
                type_str,
                message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(
                target: "rcompute-debug-messenger",
                "[{}] {}",
                type_str,
                message
            );
        }
        _ => {
            tracing::debug!(
                target: "rcompute-debug-messenger",
                "[{}] {}",
                type_str,
                message
            );
        }
    }

    vk::FALSE
}

impl Instance {
    /// Creates a new instance by loading Vulkan and negotiating the
    /// requested layers and extensions against what the loader reports.
    ///
    /// Required requests that are unavailable fail creation with the
    /// first missing name; unavailable optional requests are dropped
    /// and reported through `sink`. When `max_log_level` is set, the
    /// Khronos validation layer and the debug-utils extension are
    /// requested as optionals on the caller's behalf and a debug
    /// messenger routing into [`tracing`] is installed if both landed.
    ///
    /// # Safety
    /// This loads vulkan using libloading, meaning that there can be
    /// arbitrary code executed. This is not great but it's *probably*
    /// fine?
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        max_log_level: Option<VulkanLogLevel>,
        requested_layers: &[CapabilityRequest],
        requested_extensions: &[CapabilityRequest],
        sink: &dyn DiagnosticSink,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name_cstring = match CString::from_str(app_name.as_ref()) {
            Ok(cstr) => cstr,
            Err(_) => Err(Error::InvalidAppName)?,
        };
        //SAFETY: We pass on the burden of the safety from loading dlls to the
        //caller. As for Entry, we ensure all other vulkan objects are dropped
        //before Entry is dropped (handled in the Drop impl of Instance)
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        // SAFETY: entry is a live Vulkan entry;
        // vkEnumerateInstanceVersion has no preconditions beyond a valid
        // entry point.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .unwrap_or(Some(vk::API_VERSION_1_0))
            .unwrap_or(vk::API_VERSION_1_0);

        // SAFETY: entry is a live Vulkan entry; passing None queries
        // global extensions and does not dereference any layer name.
        let instance_exts_avail =
            unsafe { entry.enumerate_instance_extension_properties(None) }?;
        // SAFETY: entry is a live Vulkan entry;
        // vkEnumerateInstanceLayerProperties has no additional preconditions.
        let instance_layers_avail =
            unsafe { entry.enumerate_instance_layer_properties() }?;

        let avail_ext_names: Vec<CString> = instance_exts_avail
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(CString::from)
            .collect();
        let avail_layer_names: Vec<CString> = instance_layers_avail
            .iter()
            .filter_map(|layer| layer.layer_name_as_c_str().ok())
            .map(CString::from)
            .collect();

        // The built-in diagnostics capabilities are appended as
        // optionals after the caller's requests: negotiation keeps the
        // first occurrence of a name, so a caller entry for the same
        // layer or extension wins and nothing is enabled twice.
        let mut layer_requests = requested_layers.to_vec();
        let mut ext_requests = requested_extensions.to_vec();
        if max_log_level.is_some() {
            layer_requests.push(CapabilityRequest::optional(
                c"VK_LAYER_KHRONOS_validation",
            ));
            ext_requests.push(CapabilityRequest::optional(
                ash::ext::debug_utils::NAME,
            ));
        }

        let layers =
            capability::negotiate(&layer_requests, &avail_layer_names, sink)?;
        let extensions =
            capability::negotiate(&ext_requests, &avail_ext_names, sink)?;

        let debug_utils_enabled = extensions
            .iter()
            .any(|ext| ext.as_c_str() == ash::ext::debug_utils::NAME);

        let enabled_ext_ptrs: Vec<_> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();
        let enabled_layer_ptrs: Vec<_> =
            layers.iter().map(|layer| layer.as_ptr()).collect();

        let mut debug_messenger_create_info = if let Some(log_level) =
            max_log_level
            && debug_utils_enabled
        {
            let message_severity = match log_level {
                VulkanLogLevel::Verbose => {
                    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                }
                VulkanLogLevel::Info => {
                    vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                }
                VulkanLogLevel::Warning => {
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                }
                VulkanLogLevel::Error => {
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                }
            };

            Some(
                vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(message_severity)
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(vulkan_debug_callback)),
            )
        } else {
            None
        };

        let engine_name = c"rcompute";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstring)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_ext_ptrs)
            .enabled_layer_names(&enabled_layer_ptrs);

        if let Some(ref mut debug_info) = debug_messenger_create_info {
            instance_create_info = instance_create_info.push_next(debug_info);
        }

        //SAFETY: We made a valid instance_create_info
        let instance =
            unsafe { entry.create_instance(&instance_create_info, None) }?;

        let debug_messenger = if let Some(mut debug_messenger_create_info) =
            debug_messenger_create_info
        {
            debug_messenger_create_info.p_next = std::ptr::null();
            let debug_utils_instance =
                ash::ext::debug_utils::Instance::new(&entry, &instance);
            //SAFETY: Valid CI
            match unsafe {
                debug_utils_instance.create_debug_utils_messenger(
                    &debug_messenger_create_info,
                    None,
                )
            } {
                Ok(debug_messenger) => {
                    Some((debug_messenger, debug_utils_instance))
                }
                Err(e) => {
                    tracing::error!(
                        "Despite us having a valid \
                         debug_messenger_create_info \
                         We can't seem to make a debug messenger? \
                         WTF? Continuing without one but here be \
                         dragons. Actual error: {e}"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Instance {
            entry,
            handle: instance,
            debug_messenger,
            layers,
            extensions,
            ver: VkVersion::from_raw(api_version),
        })
    }

    /// [`Instance::new`] with no caller-requested layers or extensions
    /// and diagnostics routed to [`TracingSink`].
    ///
    /// # Safety
    /// Same as [`Instance::new`].
    pub unsafe fn for_compute(
        app_name: impl AsRef<str>,
        max_log_level: Option<VulkanLogLevel>,
    ) -> Result<Self, InstanceCreationError> {
        // SAFETY: Caller upholds Instance::new's contract.
        unsafe { Self::new(app_name, max_log_level, &[], &[], &TracingSink) }
    }

    /// Layer names actually enabled on this instance, in request order.
    pub fn layers(&self) -> &[CString] {
        &self.layers
    }

    /// Extension names actually enabled on this instance, in request
    /// order.
    pub fn extensions(&self) -> &[CString] {
        &self.extensions
    }

    /// Enumerate all physical devices as catalog entries.
    pub fn physical_devices(
        self: &Arc<Self>,
    ) -> Result<Vec<PhysicalDevice>, FetchPhysicalDeviceError> {
        let handles = self.fetch_raw_physical_devices()?;
        Ok(handles
            .into_iter()
            .map(|handle| PhysicalDevice::new(self.clone(), handle))
            .collect())
    }

    /// The first physical device with a compute-capable queue family.
    ///
    /// Enumeration order is driver order, so on multi-GPU hosts this is
    /// a convenience pick, not a heuristic.
    pub fn default_compute_device(
        self: &Arc<Self>,
    ) -> Result<PhysicalDevice, FetchPhysicalDeviceError> {
        self.physical_devices()?
            .into_iter()
            .find(PhysicalDevice::supports_compute)
            .ok_or(FetchPhysicalDeviceError::NoComputeDevice)
    }

    /// Get a vector of handles to available physical devices. These handles are
    /// ONLY valid in the context of this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        //SAFETY: Pretty much always fine
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }

    /// Get the properties of a physical device.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        //SAFETY: physical_device was derived from this instance
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// Get the queue family properties of a physical device.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        //SAFETY: physical_device was derived from this instance
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// Get memory properties of a physical device.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: physical_device was derived from this instance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// Create a logical device from a physical device.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    /// `create_info` must be a valid DeviceCreateInfo.
    /// Any handles referenced by `create_info` must also be derived from this
    /// instance and remain valid for the duration of the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        //SAFETY: physical_device was derived from this instance,
        //create_info is valid
        unsafe {
            self.handle
                .create_device(physical_device, create_info, None)
        }
    }

    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        if self.debug_messenger.is_some() {
            Some(ash::ext::debug_utils::Device::new(&self.handle, device))
        } else {
            None
        }
    }

    /// The Vulkan API version negotiated at instance creation time.
    ///
    /// This is the version reported by `vkEnumerateInstanceVersion`,
    /// not necessarily the version requested by the application.
    pub fn supported_ver(&self) -> VkVersion {
        self.ver
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("No physical device offers a compute-capable queue family")]
    NoComputeDevice,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_version_tuple_roundtrip() {
        let version = VkVersion::new(1, 2, 3, 4);
        let tuple = version.to_tuple();
        let rebuilt = VkVersion::from_tuple(tuple);

        assert_eq!(version.to_raw(), rebuilt.to_raw());
    }

    #[test]
    fn vk_version_raw_roundtrip() {
        let raw = vk::make_api_version(0, 1, 3, 275);
        let version = VkVersion::from_raw(raw);

        assert_eq!(version.to_raw(), raw);
        assert_eq!(version.variant(), 0);
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
    }

    #[test]
    fn log_levels_order_by_severity() {
        assert!(VulkanLogLevel::Verbose < VulkanLogLevel::Info);
        assert!(VulkanLogLevel::Info < VulkanLogLevel::Warning);
        assert!(VulkanLogLevel::Warning < VulkanLogLevel::Error);
    }
}
