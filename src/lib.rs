//! Thin RAII resource layer for Vulkan compute workloads, built on [`ash`].
//!
//! > **Personal project.** This crate is not intended for general use
//! > and makes no API stability guarantees.
//!
//! The crate covers everything between "load the Vulkan library" and
//! "hand a bound storage buffer to a compute dispatch": capability
//! negotiation, physical-device and queue-family discovery, queue
//! planning, logical-device construction, buffer/image lifecycle with
//! host mapping, and fully synchronous host/device transfers. Shader
//! compilation and dispatch live above this crate.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! └── PhysicalDevice (catalog entry: queue families, memory types)
//!     └── Device (logical device + planned QueueHandles)
//!         ├── DeviceBuffer → MappedView<T>
//!         ├── DeviceImage
//!         ├── TransferCommandPool → TransferCommandBuffer
//!         ├── TransferEngine
//!         └── Fence
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be
//! destroyed while children are alive.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod capability;
pub mod command;
pub mod device;
pub mod image;
pub mod instance;
pub mod physical;
pub mod queue;
pub mod sync;
pub mod transfer;

pub use ash;

pub use buffer::{DeviceBuffer, MappedView};
pub use capability::{CapabilityRequest, DiagnosticSink, TracingSink};
pub use device::{Device, QueueHandle, QueueRole};
pub use image::DeviceImage;
pub use instance::{Instance, VulkanLogLevel};
pub use physical::{MemoryTypeTable, PhysicalDevice, QueueFamilyInfo};
pub use queue::{QueueAllocationPlan, QueueDemand, QueueSpec};
pub use sync::Fence;
pub use transfer::TransferEngine;
