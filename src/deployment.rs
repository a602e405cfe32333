//! Deployment data model: runners, channel specifications, and the
//! deployment description handed to [`deploy`](crate::runtime::DeployRuntime::deploy).
//!
//! A deployment is immutable once `deploy()` begins; it is built either
//! programmatically through the builder methods here or decoded from a
//! JSON job description (see [`crate::description`]).

use crate::error::DeployError;
use crate::fabric::InstanceId;
use crate::topology::Topology;
use std::collections::HashSet;

/// Where a runner should execute.
#[derive(Debug, Clone)]
pub enum RunnerTarget {
    /// Pinned to a concrete instance by the caller.
    Instance(InstanceId),
    /// To be placed by the matcher on any instance whose topology
    /// satisfies this requirement.
    Topology(Topology),
}

/// One unit of user work: an entry function bound to a target instance.
#[derive(Debug, Clone)]
pub struct Runner {
    /// Unique runner id within the deployment.
    pub id: u64,
    /// Name of the registered entry function.
    pub function_name: String,
    /// Placement: direct or by required topology.
    pub target: RunnerTarget,
}

impl Runner {
    /// A runner pinned to `instance`.
    pub fn on_instance(id: u64, function_name: impl Into<String>, instance: InstanceId) -> Self {
        Self {
            id,
            function_name: function_name.into(),
            target: RunnerTarget::Instance(instance),
        }
    }

    /// A runner placed by topology matching.
    pub fn with_topology(id: u64, function_name: impl Into<String>, required: Topology) -> Self {
        Self {
            id,
            function_name: function_name.into(),
            target: RunnerTarget::Topology(required),
        }
    }
}

/// Specification of one MPSC channel between runners.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// Channel name, unique within the deployment.
    pub name: String,
    /// Runner ids of the producers. Non-empty.
    pub producers: Vec<u64>,
    /// Runner id of the single consumer. Not a producer.
    pub consumer: u64,
    /// Maximum number of pending tokens.
    pub capacity: usize,
    /// Payload ring size in bytes.
    pub payload_bytes: usize,
}

/// An ordered set of runners, a nominated coordinator, and the channels to
/// establish between them.
#[derive(Debug, Clone)]
pub struct Deployment {
    runners: Vec<Runner>,
    coordinator: InstanceId,
    channels: Vec<ChannelSpec>,
}

impl Deployment {
    /// An empty deployment coordinated by `coordinator`.
    pub fn new(coordinator: InstanceId) -> Self {
        Self {
            runners: Vec::new(),
            coordinator,
            channels: Vec::new(),
        }
    }

    /// Append a runner (builder style).
    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runners.push(runner);
        self
    }

    /// Append a channel specification (builder style).
    pub fn with_channel(mut self, channel: ChannelSpec) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn runners(&self) -> &[Runner] {
        &self.runners
    }

    pub fn coordinator(&self) -> InstanceId {
        self.coordinator
    }

    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    /// Check the structural invariants every instance can verify locally:
    /// runner id uniqueness, direct-assignment uniqueness, and channel
    /// sanity. Function registration and matched-instance uniqueness are
    /// checked by the coordinator during `deploy`.
    pub fn validate(&self) -> Result<(), DeployError> {
        let mut runner_ids = HashSet::new();
        let mut direct_instances = HashSet::new();
        for runner in &self.runners {
            if runner.function_name.is_empty() {
                return Err(DeployError::InvalidDescription(format!(
                    "runner {} has an empty function name",
                    runner.id
                )));
            }
            if !runner_ids.insert(runner.id) {
                return Err(DeployError::DuplicateRunnerId(runner.id));
            }
            if let RunnerTarget::Instance(instance) = runner.target {
                if !direct_instances.insert(instance) {
                    return Err(DeployError::DuplicateInstanceId(instance));
                }
            }
        }

        let mut channel_names = HashSet::new();
        for channel in &self.channels {
            if channel.name.is_empty() {
                return Err(DeployError::InvalidDescription(
                    "channel with empty name".into(),
                ));
            }
            if !channel_names.insert(channel.name.as_str()) {
                return Err(DeployError::InvalidDescription(format!(
                    "channel `{}` is declared twice",
                    channel.name
                )));
            }
            if channel.producers.is_empty() {
                return Err(DeployError::InvalidDescription(format!(
                    "channel `{}` has no producers",
                    channel.name
                )));
            }
            if channel.producers.contains(&channel.consumer) {
                return Err(DeployError::InvalidDescription(format!(
                    "channel `{}` lists its consumer as a producer",
                    channel.name
                )));
            }
            if channel.capacity == 0 || channel.payload_bytes == 0 {
                return Err(DeployError::InvalidDescription(format!(
                    "channel `{}` has a zero-sized buffer",
                    channel.name
                )));
            }
            for id in channel.producers.iter().chain([&channel.consumer]) {
                if !runner_ids.contains(id) {
                    return Err(DeployError::InvalidDescription(format!(
                        "channel `{}` references unknown runner {id}",
                        channel.name
                    )));
                }
            }
        }
        Ok(())
    }
}
