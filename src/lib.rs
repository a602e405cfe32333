//! # DeployR
//!
//! A topology-aware distributed job deployment runtime. A job is a set of
//! runners, each an entry function that must execute on a dedicated
//! instance whose hardware topology satisfies the runner's requirements.
//! The runtime matches runners onto instances (Hopcroft-Karp bipartite
//! matching over the gathered topologies), dispatches each entry over an
//! RPC control plane, and can establish bounded multi-producer
//! single-consumer channels between the launched runners.

pub mod channel;
pub mod cli;
pub mod deployment;
pub mod description;
pub mod error;
pub mod fabric;
pub mod matcher;
pub mod rpc;
pub mod runtime;
pub mod topology;

pub use channel::{Channel, ChannelRole, ChannelSet, Token};
pub use deployment::{ChannelSpec, Deployment, Runner, RunnerTarget};
pub use description::JobDescription;
pub use error::DeployError;
pub use fabric::{Fabric, FabricKind, InstanceId, LocalFabric};
pub use matcher::match_topologies;
pub use rpc::{ReturnBuffer, RpcContext, RpcEngine};
pub use runtime::{DeployRuntime, GET_TOPOLOGY_TARGET, RELEASE_TARGET};
pub use topology::{is_subset, Device, Topology};

/// The current version of the deployment runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default channel capacity in tokens
    pub const CHANNEL_CAPACITY: usize = 16;

    /// Default channel payload ring size in bytes
    pub const CHANNEL_PAYLOAD_BYTES: usize = 4096;

    /// Default memory size reported by demo instances
    pub const DEMO_MEMORY_BYTES: u64 = 4 << 30;

    /// Default compute resource count reported by demo instances
    pub const DEMO_COMPUTE_RESOURCES: usize = 4;
}
