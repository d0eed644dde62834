//! Physical device catalog: queue-family and memory-type snapshots.
//!
//! [`PhysicalDevice`] is a catalog entry produced by
//! [`Instance::physical_devices`](crate::instance::Instance::physical_devices).
//! It caches the hardware's queue-family layout ([`QueueFamilyInfo`]) and
//! lazily queries the memory-type table ([`MemoryTypeTable`]). Both are
//! pure read-only snapshots: nothing here mutates hardware state, and
//! all selection logic operates on the snapshot values so it can be
//! exercised without a driver.

use std::sync::{Arc, OnceLock};

use ash::vk;
use thiserror::Error;

use crate::device::{CreateDeviceError, Device};
use crate::instance::Instance;
use crate::queue::{self, QueueDemand};

/// Hardware-reported snapshot of one queue family. Immutable once
/// queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub family_id: u32,
    pub queue_count: u32,
    pub can_compute: bool,
    pub can_transfer: bool,
}

impl QueueFamilyInfo {
    /// A family whose queues support both compute and transfer work.
    pub fn is_mixed(&self) -> bool {
        self.can_compute && self.can_transfer
    }

    pub(crate) fn from_properties(
        family_id: u32,
        props: &vk::QueueFamilyProperties,
    ) -> Self {
        let flags = props.queue_flags;
        let can_compute = flags.contains(vk::QueueFlags::COMPUTE);
        // COMPUTE and GRAPHICS queues support transfer even when the
        // TRANSFER bit is not reported (implicit per the Vulkan spec).
        let can_transfer = flags.contains(vk::QueueFlags::TRANSFER)
            || can_compute
            || flags.contains(vk::QueueFlags::GRAPHICS);
        Self {
            family_id,
            queue_count: props.queue_count,
            can_compute,
            can_transfer,
        }
    }
}

/// One entry of the hardware memory-type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeEntry {
    pub type_index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
}

/// The memory types a physical device reports, in driver order.
///
/// Read-only. Drivers list preferred types first, so "lowest qualifying
/// index" is the deterministic best-match rule used by
/// [`select`](Self::select).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTypeTable {
    entries: Vec<MemoryTypeEntry>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("No device memory type satisfies property flags {required:?}")]
pub struct NoSuitableMemoryFound {
    pub required: vk::MemoryPropertyFlags,
}

impl MemoryTypeTable {
    pub fn new(entries: Vec<MemoryTypeEntry>) -> Self {
        Self { entries }
    }

    pub(crate) fn from_properties(
        props: &vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        let entries = props.memory_types
            [..props.memory_type_count as usize]
            .iter()
            .enumerate()
            .map(|(i, ty)| MemoryTypeEntry {
                type_index: i as u32,
                property_flags: ty.property_flags,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MemoryTypeEntry] {
        &self.entries
    }

    /// Select the lowest-indexed type whose flags are a superset of
    /// `required`.
    pub fn select(
        &self,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32, NoSuitableMemoryFound> {
        self.select_masked(required, u32::MAX)
    }

    /// [`select`](Self::select) restricted to the types allowed by
    /// `type_mask` (a `vk::MemoryRequirements::memory_type_bits` value).
    pub fn select_masked(
        &self,
        required: vk::MemoryPropertyFlags,
        type_mask: u32,
    ) -> Result<u32, NoSuitableMemoryFound> {
        self.entries
            .iter()
            .filter(|e| e.type_index < 32 && type_mask & (1 << e.type_index) != 0)
            .find(|e| e.property_flags.contains(required))
            .map(|e| e.type_index)
            .ok_or(NoSuitableMemoryFound { required })
    }

    /// Property flags of the type at `type_index`, or empty flags for an
    /// index the table does not contain.
    pub fn flags_of(&self, type_index: u32) -> vk::MemoryPropertyFlags {
        self.entries
            .iter()
            .find(|e| e.type_index == type_index)
            .map(|e| e.property_flags)
            .unwrap_or_default()
    }
}

/// A physical compute device enumerated from an [`Instance`].
///
/// Caches device properties and the queue-family snapshot; the
/// memory-type table is queried lazily on first use. The handle stays
/// valid for the lifetime of the parent instance.
pub struct PhysicalDevice {
    parent: Arc<Instance>,
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    queue_families: Vec<QueueFamilyInfo>,
    memory_types: OnceLock<MemoryTypeTable>,
}

impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDevice")
            .field("handle", &self.handle)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl PhysicalDevice {
    pub(crate) fn new(
        parent: Arc<Instance>,
        handle: vk::PhysicalDevice,
    ) -> Self {
        // SAFETY: handle was enumerated from parent.
        let properties =
            unsafe { parent.get_raw_physical_device_properties(handle) };
        // SAFETY: handle was enumerated from parent.
        let raw_families = unsafe {
            parent.get_raw_physical_device_queue_family_properties(handle)
        };
        let queue_families = raw_families
            .iter()
            .enumerate()
            .map(|(i, props)| {
                QueueFamilyInfo::from_properties(i as u32, props)
            })
            .collect();

        Self {
            parent,
            handle,
            properties,
            queue_families,
            memory_types: OnceLock::new(),
        }
    }

    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .unwrap_or(c"unknown")
            .to_string_lossy()
            .into_owned()
    }

    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.properties.device_type
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Queue families in hardware-reported order (index = family id).
    pub fn queue_families(&self) -> &[QueueFamilyInfo] {
        &self.queue_families
    }

    /// The memory-type table, queried from the driver on first access.
    pub fn memory_types(&self) -> &MemoryTypeTable {
        self.memory_types.get_or_init(|| {
            // SAFETY: handle was enumerated from parent.
            let props = unsafe {
                self.parent
                    .get_raw_physical_device_memory_properties(self.handle)
            };
            MemoryTypeTable::from_properties(&props)
        })
    }

    /// Total queues across compute-capable families (mixed included).
    pub fn num_compute_queues(&self) -> u32 {
        self.queue_families
            .iter()
            .filter(|f| f.can_compute)
            .map(|f| f.queue_count)
            .sum()
    }

    /// Total queues across transfer-capable families (mixed included).
    pub fn num_transfer_queues(&self) -> u32 {
        self.queue_families
            .iter()
            .filter(|f| f.can_transfer)
            .map(|f| f.queue_count)
            .sum()
    }

    /// Total queues across families supporting both compute and
    /// transfer.
    pub fn num_mixed_queues(&self) -> u32 {
        self.queue_families
            .iter()
            .filter(|f| f.is_mixed())
            .map(|f| f.queue_count)
            .sum()
    }

    pub fn supports_compute(&self) -> bool {
        self.queue_families.iter().any(|f| f.can_compute)
    }

    /// Create a logical device on this physical device, planning queues
    /// for `demand`.
    pub fn compute_device(
        &self,
        demand: &QueueDemand,
    ) -> Result<Device, CreateDeviceError> {
        let plan = queue::plan(&self.queue_families, demand)?;
        Device::create(&self.parent, self, plan)
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn raw_physical_device(&self) -> vk::PhysicalDevice {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(flag_sets: &[vk::MemoryPropertyFlags]) -> MemoryTypeTable {
        MemoryTypeTable::new(
            flag_sets
                .iter()
                .enumerate()
                .map(|(i, &property_flags)| MemoryTypeEntry {
                    type_index: i as u32,
                    property_flags,
                })
                .collect(),
        )
    }

    #[test]
    fn select_returns_lowest_qualifying_index() {
        use vk::MemoryPropertyFlags as F;
        let table = table(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
        ]);

        assert_eq!(table.select(F::HOST_VISIBLE).unwrap(), 1);
        assert_eq!(table.select(F::DEVICE_LOCAL).unwrap(), 0);
        assert_eq!(
            table.select(F::HOST_VISIBLE | F::HOST_CACHED).unwrap(),
            2
        );
    }

    #[test]
    fn select_with_empty_flags_takes_first_type() {
        use vk::MemoryPropertyFlags as F;
        let table = table(&[F::DEVICE_LOCAL, F::HOST_VISIBLE]);
        assert_eq!(table.select(F::empty()).unwrap(), 0);
    }

    #[test]
    fn select_fails_when_no_type_qualifies() {
        use vk::MemoryPropertyFlags as F;
        let table = table(&[F::DEVICE_LOCAL, F::HOST_VISIBLE]);

        let err = table
            .select(F::HOST_VISIBLE | F::HOST_CACHED)
            .unwrap_err();
        assert_eq!(err.required, F::HOST_VISIBLE | F::HOST_CACHED);
    }

    #[test]
    fn select_masked_skips_disallowed_types() {
        use vk::MemoryPropertyFlags as F;
        let table = table(&[
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);

        // Type 0 qualifies but is masked out.
        assert_eq!(table.select_masked(F::HOST_VISIBLE, 0b10).unwrap(), 1);
        assert!(table.select_masked(F::HOST_VISIBLE, 0).is_err());
    }

    #[test]
    fn flags_of_reports_table_entry() {
        use vk::MemoryPropertyFlags as F;
        let table = table(&[F::DEVICE_LOCAL, F::HOST_VISIBLE]);
        assert_eq!(table.flags_of(1), F::HOST_VISIBLE);
        assert_eq!(table.flags_of(7), F::empty());
    }

    #[test]
    fn queue_family_transfer_is_implied_by_compute() {
        let props = vk::QueueFamilyProperties::default()
            .queue_flags(vk::QueueFlags::COMPUTE)
            .queue_count(2);
        let info = QueueFamilyInfo::from_properties(3, &props);

        assert_eq!(info.family_id, 3);
        assert_eq!(info.queue_count, 2);
        assert!(info.can_compute);
        assert!(info.can_transfer);
        assert!(info.is_mixed());
    }

    #[test]
    fn queue_family_transfer_only() {
        let props = vk::QueueFamilyProperties::default()
            .queue_flags(vk::QueueFlags::TRANSFER)
            .queue_count(1);
        let info = QueueFamilyInfo::from_properties(0, &props);

        assert!(!info.can_compute);
        assert!(info.can_transfer);
        assert!(!info.is_mixed());
    }
}
