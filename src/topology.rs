//! # Hardware Topology Model
//!
//! Canonical description of one instance's hardware: an unordered set of
//! devices, each carrying typed memory spaces and compute resources. The
//! model serves two purposes:
//!
//! - it is the unit gathered over RPC during deployment, so it must
//!   round-trip through a deterministic serialized form;
//! - it feeds the matcher through the [`is_subset`] compatibility
//!   predicate.
//!
//! The serialized form is JSON with the reserved key names `Devices`,
//! `Type`, `Memory Spaces`, `Size` and `Compute Resources`. Keys the model
//! does not know are preserved verbatim across a round-trip but ignored by
//! the subset check, so topology reports from newer discovery backends
//! survive passing through an older coordinator.

use crate::error::DeployError;
use serde::{Deserialize, Serialize};

/// One memory space of a device: a type tag plus its size in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySpace {
    /// Memory space type tag, e.g. `"ram"` or `"hbm"`. Must be non-empty.
    #[serde(rename = "Type")]
    pub space_type: String,

    /// Size of the space in bytes.
    #[serde(rename = "Size")]
    pub size: u64,

    /// Keys preserved verbatim but not interpreted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One compute resource of a device, identified only by its type tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeResource {
    /// Compute resource type tag, e.g. `"core"`. Must be non-empty.
    #[serde(rename = "Type")]
    pub resource_type: String,

    /// Keys preserved verbatim but not interpreted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A device: a type tag, ordered memory spaces, ordered compute resources.
///
/// Device order within a topology is preserved by serialization and is
/// significant for the greedy consumption order of [`is_subset`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device type tag, e.g. `"cpu"` or `"gpu"`. Unknown tags are carried
    /// verbatim; they only ever compare against other tags.
    #[serde(rename = "Type")]
    pub device_type: String,

    /// Memory spaces in declaration order.
    #[serde(rename = "Memory Spaces", default)]
    pub memory_spaces: Vec<MemorySpace>,

    /// Compute resources in declaration order.
    #[serde(rename = "Compute Resources", default)]
    pub compute_resources: Vec<ComputeResource>,

    /// Keys preserved verbatim but not interpreted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Device {
    /// Create a device with the given type tag and no resources.
    pub fn new(device_type: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            ..Self::default()
        }
    }

    /// Append a memory space (builder style).
    pub fn with_memory(mut self, space_type: impl Into<String>, size: u64) -> Self {
        self.memory_spaces.push(MemorySpace {
            space_type: space_type.into(),
            size,
            extra: Default::default(),
        });
        self
    }

    /// Append a compute resource (builder style).
    pub fn with_compute(mut self, resource_type: impl Into<String>) -> Self {
        self.compute_resources.push(ComputeResource {
            resource_type: resource_type.into(),
            extra: Default::default(),
        });
        self
    }

    /// Total bytes across all memory spaces of this device.
    pub fn total_memory_bytes(&self) -> u64 {
        self.memory_spaces.iter().map(|m| m.size).sum()
    }

    /// Number of compute resources on this device.
    pub fn compute_count(&self) -> usize {
        self.compute_resources.len()
    }
}

/// The hardware topology of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Devices in declaration order.
    #[serde(rename = "Devices", default)]
    pub devices: Vec<Device>,

    /// Keys preserved verbatim but not interpreted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Topology {
    /// An empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device (builder style).
    pub fn with_device(mut self, device: Device) -> Self {
        self.devices.push(device);
        self
    }

    /// Append `other`'s devices to `self`, preserving order.
    ///
    /// Used to combine per-backend topology reports discovered on one
    /// host into a single report. Top-level preserved keys of `other`
    /// are discarded; per-device keys travel with their device.
    pub fn merge(&mut self, other: Topology) {
        self.devices.extend(other.devices);
    }

    /// Serialize into the canonical byte form.
    ///
    /// The form is deterministic: device, memory-space and compute-resource
    /// order is preserved, known keys appear in declaration order, and
    /// preserved unknown keys are emitted in sorted order.
    pub fn serialize(&self) -> Result<Vec<u8>, DeployError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(|e| DeployError::InvalidFormat(e.to_string()))
    }

    /// Decode a topology from its canonical byte form.
    ///
    /// Malformed input fails with `InvalidFormat`. Unknown device type
    /// tags are not a failure; they are preserved verbatim.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, DeployError> {
        let topology: Topology =
            serde_json::from_slice(bytes).map_err(|e| DeployError::InvalidFormat(e.to_string()))?;
        topology.validate()?;
        Ok(topology)
    }

    /// Check the structural invariants: every type tag is non-empty.
    pub fn validate(&self) -> Result<(), DeployError> {
        for device in &self.devices {
            if device.device_type.is_empty() {
                return Err(DeployError::InvalidFormat(
                    "device with empty type tag".into(),
                ));
            }
            if device.memory_spaces.iter().any(|m| m.space_type.is_empty()) {
                return Err(DeployError::InvalidFormat(format!(
                    "device `{}` has a memory space with an empty type tag",
                    device.device_type
                )));
            }
            if device
                .compute_resources
                .iter()
                .any(|c| c.resource_type.is_empty())
            {
                return Err(DeployError::InvalidFormat(format!(
                    "device `{}` has a compute resource with an empty type tag",
                    device.device_type
                )));
            }
        }
        Ok(())
    }
}

/// Whether `host` can satisfy `required`.
///
/// Holds iff every device of `required` can be paired with a distinct
/// device of `host` that has the same type tag, at least as many total
/// memory bytes, and at least as many compute resources. Host devices are
/// tried greedily in declaration order and consumed on first match, so one
/// host device satisfies at most one required device. O(|host| * |required|).
pub fn is_subset(host: &Topology, required: &Topology) -> bool {
    let mut consumed = vec![false; host.devices.len()];
    'required: for needed in &required.devices {
        for (i, offered) in host.devices.iter().enumerate() {
            if consumed[i] {
                continue;
            }
            if offered.device_type == needed.device_type
                && offered.total_memory_bytes() >= needed.total_memory_bytes()
                && offered.compute_count() >= needed.compute_count()
            {
                consumed[i] = true;
                continue 'required;
            }
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(memory: u64, cores: usize) -> Topology {
        let mut device = Device::new("cpu").with_memory("ram", memory);
        for _ in 0..cores {
            device = device.with_compute("core");
        }
        Topology::new().with_device(device)
    }

    /// Every topology is a subset of itself.
    #[test]
    fn subset_is_reflexive() {
        let topologies = [
            Topology::new(),
            node(4 << 30, 2),
            node(64 << 30, 16).with_device(Device::new("gpu").with_memory("hbm", 32 << 30)),
        ];
        for t in &topologies {
            assert!(is_subset(t, t));
        }
    }

    #[test]
    fn subset_respects_memory_and_compute() {
        let big = node(64 << 30, 8);
        let small = node(4 << 30, 2);
        assert!(is_subset(&big, &small));
        assert!(!is_subset(&small, &big));

        let more_cores = node(4 << 30, 4);
        assert!(!is_subset(&small, &more_cores));
    }

    #[test]
    fn subset_consumes_each_host_device_once() {
        let host = node(8 << 30, 4);
        let mut required = node(4 << 30, 1);
        required.merge(node(4 << 30, 1));
        // One 8 GB host device cannot back two required devices.
        assert!(!is_subset(&host, &required));
    }

    #[test]
    fn subset_ignores_device_type_mismatch() {
        let host = Topology::new().with_device(Device::new("gpu").with_memory("hbm", 64 << 30));
        let required = Topology::new().with_device(Device::new("cpu").with_memory("ram", 1 << 30));
        assert!(!is_subset(&host, &required));
    }

    /// Canonical form round-trips byte for byte and structurally.
    #[test]
    fn serialization_round_trips() {
        let topology = node(64 << 30, 16)
            .with_device(Device::new("gpu").with_memory("hbm", 32 << 30).with_compute("sm"));
        let bytes = topology.serialize().unwrap();
        let decoded = Topology::deserialize(&bytes).unwrap();
        assert_eq!(decoded, topology);
        assert!(is_subset(&decoded, &topology));
        assert_eq!(decoded.serialize().unwrap(), bytes);
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let encoded = br#"{"Devices":[{"Type":"fpga","Memory Spaces":[{"Type":"bram","Size":1024,"Vendor":"x"}],"Compute Resources":[],"Firmware":"v2"}],"Site":"lab"}"#;
        let topology = Topology::deserialize(encoded).unwrap();
        assert_eq!(topology.devices[0].device_type, "fpga");
        assert_eq!(topology.extra["Site"], "lab");
        assert_eq!(topology.devices[0].extra["Firmware"], "v2");

        let bytes = topology.serialize().unwrap();
        let again = Topology::deserialize(&bytes).unwrap();
        assert_eq!(again, topology);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            Topology::deserialize(b"not json"),
            Err(DeployError::InvalidFormat(_))
        ));
        // Empty type tags violate the model invariants.
        assert!(matches!(
            Topology::deserialize(br#"{"Devices":[{"Type":""}]}"#),
            Err(DeployError::InvalidFormat(_))
        ));
    }

    #[test]
    fn merge_appends_in_order() {
        let mut report = node(4 << 30, 2);
        report.merge(
            Topology::new().with_device(Device::new("gpu").with_memory("hbm", 16 << 30)),
        );
        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.devices[0].device_type, "cpu");
        assert_eq!(report.devices[1].device_type, "gpu");
    }
}
