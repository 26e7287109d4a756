//! Simulated compute devices.
//!
//! A device is a description of where buffers live and how wide its SIMD groups are.
//! Work submitted for a device runs on the host's thread pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use atomic64::warp::DEFAULT_GROUP_WIDTH;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// Visible to both host and device. Used on unified memory devices.
    Shared,
    /// Device memory only. Used on discrete devices.
    Private,
}

/// Static properties of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    /// Whether host and device share one memory pool.
    pub unified_memory: bool,
    /// Number of lanes in one SIMD group.
    pub simd_width: usize,
    /// Largest single buffer the device can allocate, in bytes.
    pub max_buffer_length: usize,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            name: String::from("host"),
            unified_memory: true,
            simd_width: DEFAULT_GROUP_WIDTH,
            max_buffer_length: 1 << 30,
        }
    }
}

/// A compute device. Clones refer to the same device.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

#[derive(Debug)]
struct DeviceInner {
    id: u64,
    properties: DeviceProperties,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Device {}

impl Device {
    pub fn new(properties: DeviceProperties) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
                properties,
            }),
        }
    }

    /// A unified memory device with default properties.
    pub fn system_default() -> Self {
        Self::new(DeviceProperties::default())
    }

    /// A discrete device whose buffers live in private storage.
    pub fn discrete(name: impl Into<String>) -> Self {
        Self::new(DeviceProperties {
            name: name.into(),
            unified_memory: false,
            ..Default::default()
        })
    }

    /// Process-unique identifier of this device.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.properties.name
    }

    pub fn has_unified_memory(&self) -> bool {
        self.inner.properties.unified_memory
    }

    pub fn simd_width(&self) -> usize {
        self.inner.properties.simd_width
    }

    pub fn max_buffer_length(&self) -> usize {
        self.inner.properties.max_buffer_length
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.properties
    }

    /// Storage mode used for buffers the runtime allocates on this device.
    pub fn preferred_storage_mode(&self) -> StorageMode {
        if self.has_unified_memory() {
            StorageMode::Shared
        } else {
            StorageMode::Private
        }
    }
}
