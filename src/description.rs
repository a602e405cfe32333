//! # Job Description Decoding
//!
//! Decodes the user-supplied JSON job description into a
//! [`Deployment`]. The format is an object with a `Runners` array and an
//! optional `Channels` array:
//!
//! ```json
//! {
//!   "Runners": [
//!     { "Function": "CoordinatorFc", "Topology": { "Devices": [] } },
//!     { "Function": "WorkerFc", "InstanceId": 1 }
//!   ],
//!   "Channels": [
//!     { "Name": "data", "Producers": [1], "Consumer": 0,
//!       "Capacity": 16, "PayloadBytes": 4096 }
//!   ]
//! }
//! ```
//!
//! Every runner must carry either a `Topology` (placed by the matcher) or
//! an `InstanceId` (pinned); carrying neither, or both, is an
//! `InvalidDescription`. Runner ids are assigned from description order.

use crate::deployment::{ChannelSpec, Deployment, Runner};
use crate::error::DeployError;
use crate::fabric::InstanceId;
use crate::topology::Topology;
use serde::Deserialize;
use std::path::Path;

/// One runner entry of the description.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerDescription {
    /// Name of the entry function to dispatch.
    #[serde(rename = "Function")]
    pub function: String,

    /// Required topology, for matcher placement.
    #[serde(rename = "Topology", default)]
    pub topology: Option<Topology>,

    /// Direct instance assignment.
    #[serde(rename = "InstanceId", default)]
    pub instance_id: Option<InstanceId>,
}

/// One channel entry of the description.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelDescription {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Producers")]
    pub producers: Vec<u64>,
    #[serde(rename = "Consumer")]
    pub consumer: u64,
    #[serde(rename = "Capacity", default = "default_capacity")]
    pub capacity: usize,
    #[serde(rename = "PayloadBytes", default = "default_payload_bytes")]
    pub payload_bytes: usize,
}

fn default_capacity() -> usize {
    crate::defaults::CHANNEL_CAPACITY
}

fn default_payload_bytes() -> usize {
    crate::defaults::CHANNEL_PAYLOAD_BYTES
}

/// A decoded job description.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDescription {
    #[serde(rename = "Runners")]
    pub runners: Vec<RunnerDescription>,

    #[serde(rename = "Channels", default)]
    pub channels: Vec<ChannelDescription>,
}

impl JobDescription {
    /// Decode a description from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, DeployError> {
        serde_json::from_slice(bytes).map_err(|e| DeployError::InvalidDescription(e.to_string()))
    }

    /// Load and decode a description file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            DeployError::InvalidDescription(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&bytes)
    }

    /// The distinct function names the description references, in first
    /// occurrence order.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for runner in &self.runners {
            if !names.contains(&runner.function) {
                names.push(runner.function.clone());
            }
        }
        names
    }

    /// Convert into a validated [`Deployment`] coordinated by
    /// `coordinator`. Runner ids are the description indices.
    pub fn into_deployment(self, coordinator: InstanceId) -> Result<Deployment, DeployError> {
        let mut deployment = Deployment::new(coordinator);
        for (index, runner) in self.runners.into_iter().enumerate() {
            let id = index as u64;
            let runner = match (runner.instance_id, runner.topology) {
                (Some(instance), None) => Runner::on_instance(id, runner.function, instance),
                (None, Some(topology)) => {
                    topology.validate()?;
                    Runner::with_topology(id, runner.function, topology)
                }
                (None, None) => {
                    return Err(DeployError::InvalidDescription(format!(
                        "runner {index} names neither a topology nor an instance"
                    )))
                }
                (Some(_), Some(_)) => {
                    return Err(DeployError::InvalidDescription(format!(
                        "runner {index} names both a topology and an instance"
                    )))
                }
            };
            deployment = deployment.with_runner(runner);
        }
        for channel in self.channels {
            deployment = deployment.with_channel(ChannelSpec {
                name: channel.name,
                producers: channel.producers,
                consumer: channel.consumer,
                capacity: channel.capacity,
                payload_bytes: channel.payload_bytes,
            });
        }
        deployment.validate()?;
        Ok(deployment)
    }
}
