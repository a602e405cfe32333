//! # Deployment Runtime
//!
//! The per-instance runtime object driving a deployment end to end. One
//! `DeployRuntime` is constructed per participating instance, over that
//! instance's fabric endpoint and locally discovered topology; there is no
//! process-global state.
//!
//! ## Lifecycle
//!
//! ```text
//!   new -> initialize -> [register entries] -> deploy -> finalize
//! ```
//!
//! `initialize` registers the built-in RPC targets. `deploy` then branches
//! on the instance's role:
//!
//! - the **coordinator** resolves placements (gathering topologies over
//!   RPC and running the matcher when needed), validates the deployment,
//!   dispatches a launch RPC per remote runner, releases runner-less
//!   instances, establishes the channels, and finally runs its own entry
//!   if one was assigned to it;
//! - every **worker** parks in `listen` until a launch (or release) RPC
//!   arrives, establishes the channels, and runs the assigned entry.
//!
//! The launch RPC target registered for each user function only records
//! the assignment and replies; the entry itself runs after the collective
//! channel handshake. Entries are asynchronous closures; they reach the
//! runner id through [`RpcContext::argument`] and the channels through the
//! [`ChannelSet`] handle, both captured at registration time.

use crate::channel::{self, ChannelRole, ChannelSet};
use crate::deployment::{Deployment, RunnerTarget};
use crate::error::DeployError;
use crate::fabric::{Fabric, InstanceId};
use crate::matcher::match_topologies;
use crate::rpc::{RpcContext, RpcEngine};
use crate::topology::Topology;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Reserved RPC target serving the local topology to the coordinator.
pub const GET_TOPOLOGY_TARGET: &str = "[DeployR] Get Topology";
/// Reserved RPC target releasing an instance that hosts no runner.
pub const RELEASE_TARGET: &str = "[DeployR] Release";

type EntryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type EntryFn = Box<dyn FnMut() -> EntryFuture + Send>;

/// What the dispatch RPC assigned to this instance.
enum LaunchOrder {
    /// Run the named entry as the given runner.
    Run { function: String, runner_id: u64 },
    /// No runner here; participate in channel handshakes and finish.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Initialized,
}

/// The per-instance deployment runtime.
pub struct DeployRuntime {
    fabric: Arc<dyn Fabric>,
    rpc: RpcEngine,
    topology: Topology,
    entries: Arc<Mutex<HashMap<String, EntryFn>>>,
    pending: Arc<Mutex<Option<LaunchOrder>>>,
    channels: Arc<ChannelSet>,
    phase: Phase,
}

impl DeployRuntime {
    /// Create a runtime over this instance's fabric endpoint and its
    /// locally discovered topology.
    pub fn new(fabric: Arc<dyn Fabric>, topology: Topology) -> Self {
        let rpc = RpcEngine::new(fabric.clone());
        Self {
            fabric,
            rpc,
            topology,
            entries: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(None)),
            channels: Arc::new(ChannelSet::new()),
            phase: Phase::New,
        }
    }

    /// Register the built-in RPC targets and arm the runtime for
    /// registration and deployment.
    pub fn initialize(&mut self) -> Result<(), DeployError> {
        if self.phase != Phase::New {
            return Ok(());
        }

        let serialized = self.topology.serialize()?;
        let context = self.rpc.context();
        self.rpc.register_target(GET_TOPOLOGY_TARGET, move || {
            if let Err(e) = context.submit_return_value(serialized.clone()) {
                debug!("topology reply dropped: {e}");
            }
        })?;

        let pending = self.pending.clone();
        self.rpc.register_target(RELEASE_TARGET, move || {
            *pending.lock() = Some(LaunchOrder::Release);
        })?;

        self.phase = Phase::Initialized;
        Ok(())
    }

    /// Register a user entry function.
    ///
    /// Installs the entry in the function table and a launch shim under
    /// the same name in the RPC target table. Fails with `DuplicateName`
    /// if either name is taken; the tables retain the first registration.
    /// Must not be called once `deploy` has started.
    pub fn register<F, Fut>(&self, name: &str, mut entry: F) -> Result<(), DeployError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let entries = self.entries.lock();
            if entries.contains_key(name) {
                return Err(DeployError::DuplicateName(name.to_string()));
            }
        }

        let pending = self.pending.clone();
        let context = self.rpc.context();
        let function = name.to_string();
        self.rpc.register_target(name, move || {
            *pending.lock() = Some(LaunchOrder::Run {
                function: function.clone(),
                runner_id: context.argument(),
            });
        })?;

        self.entries
            .lock()
            .insert(name.to_string(), Box::new(move || Box::pin(entry())));
        Ok(())
    }

    /// The context handle entries use to read their runner id.
    pub fn context(&self) -> Arc<RpcContext> {
        self.rpc.context()
    }

    /// The channel set populated during `deploy`.
    pub fn channels(&self) -> Arc<ChannelSet> {
        self.channels.clone()
    }

    /// This instance's fabric endpoint.
    pub fn fabric(&self) -> Arc<dyn Fabric> {
        self.fabric.clone()
    }

    /// The locally discovered topology.
    pub fn local_topology(&self) -> &Topology {
        &self.topology
    }

    /// Run one deployment to completion on this instance.
    ///
    /// Blocks until this instance's part is done: on the coordinator,
    /// until every launch has been dispatched and the local entry (if any)
    /// has returned; on a worker, until the assigned entry has returned or
    /// the instance was released.
    pub async fn deploy(&mut self, deployment: &Deployment) -> Result<(), DeployError> {
        if self.phase != Phase::Initialized {
            return Err(DeployError::NotInitialized);
        }
        deployment.validate()?;

        if self.fabric.current_instance() == deployment.coordinator() {
            self.run_coordinator(deployment).await
        } else {
            self.run_worker(deployment).await
        }
    }

    /// Release the channel slots and this instance's fabric resources.
    pub async fn finalize(&mut self) -> Result<(), DeployError> {
        for channel in self.channels.drain() {
            channel.release_slots();
        }
        self.fabric
            .finalize()
            .await
            .map_err(DeployError::transport)?;
        self.phase = Phase::New;
        Ok(())
    }

    async fn run_coordinator(&mut self, deployment: &Deployment) -> Result<(), DeployError> {
        let me = self.fabric.current_instance();
        info!(
            runners = deployment.runners().len(),
            channels = deployment.channels().len(),
            "coordinating deployment"
        );

        let assignments = self.resolve_assignments(deployment).await?;

        // Every referenced function must exist in the local table; the
        // per-instance check happens at dispatch through the RPC fault
        // path.
        {
            let entries = self.entries.lock();
            for assignment in &assignments {
                if !entries.contains_key(&assignment.function) {
                    return Err(DeployError::UnknownFunction(assignment.function.clone()));
                }
            }
        }

        let group: HashSet<InstanceId> = self.fabric.instances().into_iter().collect();
        let mut assigned = HashSet::new();
        for assignment in &assignments {
            if !group.contains(&assignment.instance) {
                return Err(DeployError::InvalidDescription(format!(
                    "runner {} is assigned to instance {} outside the group",
                    assignment.runner_id, assignment.instance
                )));
            }
            if !assigned.insert(assignment.instance) {
                return Err(DeployError::DuplicateInstanceId(assignment.instance));
            }
        }

        // Dispatch every remote runner; remember the local one for after
        // the channel handshake.
        let mut local: Option<&Assignment> = None;
        for assignment in &assignments {
            if assignment.instance == me {
                local = Some(assignment);
                continue;
            }
            debug!(
                runner = assignment.runner_id,
                function = %assignment.function,
                instance = assignment.instance,
                "dispatching runner"
            );
            self.rpc
                .request(assignment.instance, &assignment.function, assignment.runner_id)
                .await?
                .release();
        }

        // Instances hosting no runner still have to leave `listen` and
        // join the channel handshakes.
        for instance in self.fabric.instances() {
            if instance != me && !assigned.contains(&instance) {
                debug!(instance, "releasing idle instance");
                self.rpc.request(instance, RELEASE_TARGET, 0).await?.release();
            }
        }

        let own_runner = local.map(|a| a.runner_id);
        self.establish_channels(deployment, own_runner).await?;

        if let Some(assignment) = local {
            let (function, runner_id) = (assignment.function.clone(), assignment.runner_id);
            self.run_entry(&function, runner_id).await?;
        }
        info!("deployment dispatched");
        Ok(())
    }

    async fn run_worker(&mut self, deployment: &Deployment) -> Result<(), DeployError> {
        info!("awaiting dispatch");
        let order = loop {
            self.rpc.listen().await?;
            if let Some(order) = self.pending.lock().take() {
                break order;
            }
        };

        match order {
            LaunchOrder::Run {
                function,
                runner_id,
            } => {
                info!(runner = runner_id, function = %function, "launch received");
                self.establish_channels(deployment, Some(runner_id)).await?;
                self.run_entry(&function, runner_id).await?;
            }
            LaunchOrder::Release => {
                debug!("released without a runner");
                self.establish_channels(deployment, None).await?;
            }
        }
        Ok(())
    }

    /// Resolve every runner onto a concrete instance, gathering topologies
    /// and matching where the description left placement open.
    async fn resolve_assignments(
        &self,
        deployment: &Deployment,
    ) -> Result<Vec<Assignment>, DeployError> {
        let needs_matching = deployment
            .runners()
            .iter()
            .any(|r| matches!(r.target, RunnerTarget::Topology(_)));

        let mut assignments: Vec<Assignment> = Vec::with_capacity(deployment.runners().len());
        if !needs_matching {
            for runner in deployment.runners() {
                let RunnerTarget::Instance(instance) = runner.target else {
                    unreachable!("no topology targets on this path");
                };
                assignments.push(Assignment {
                    runner_id: runner.id,
                    function: runner.function_name.clone(),
                    instance,
                });
            }
            return Ok(assignments);
        }

        let hosts = self.gather_global_topology().await?;

        // Instances claimed directly are off the table for the matcher.
        let claimed: HashSet<InstanceId> = deployment
            .runners()
            .iter()
            .filter_map(|r| match r.target {
                RunnerTarget::Instance(instance) => Some(instance),
                RunnerTarget::Topology(_) => None,
            })
            .collect();
        let candidates: Vec<&(InstanceId, Topology)> = hosts
            .iter()
            .filter(|(instance, _)| !claimed.contains(instance))
            .collect();

        let required: Vec<Topology> = deployment
            .runners()
            .iter()
            .filter_map(|r| match &r.target {
                RunnerTarget::Topology(topology) => Some(topology.clone()),
                RunnerTarget::Instance(_) => None,
            })
            .collect();
        let given: Vec<Topology> = candidates.iter().map(|(_, t)| t.clone()).collect();

        let placement = match_topologies(&required, &given).ok_or(DeployError::Unmatchable)?;
        info!(matched = placement.len(), "topology matching complete");

        let mut next = 0;
        for runner in deployment.runners() {
            let instance = match &runner.target {
                RunnerTarget::Instance(instance) => *instance,
                RunnerTarget::Topology(_) => {
                    let chosen = candidates[placement[next]].0;
                    next += 1;
                    chosen
                }
            };
            assignments.push(Assignment {
                runner_id: runner.id,
                function: runner.function_name.clone(),
                instance,
            });
        }
        Ok(assignments)
    }

    /// Collect every participant's topology: peers over RPC, self
    /// directly.
    async fn gather_global_topology(&self) -> Result<Vec<(InstanceId, Topology)>, DeployError> {
        let me = self.fabric.current_instance();
        let mut hosts = Vec::new();
        for instance in self.fabric.instances() {
            if instance == me {
                hosts.push((instance, self.topology.clone()));
                continue;
            }
            debug!(instance, "gathering topology");
            let reply = self.rpc.request(instance, GET_TOPOLOGY_TARGET, 0).await?;
            let bytes = reply
                .bytes()
                .ok_or_else(|| DeployError::InvalidFormat("empty topology reply".into()))?;
            let topology = Topology::deserialize(bytes)?;
            reply.release();
            hosts.push((instance, topology));
        }
        Ok(hosts)
    }

    /// Establish every channel of the deployment, in declaration order,
    /// with the role derived from this instance's runner id.
    async fn establish_channels(
        &self,
        deployment: &Deployment,
        own_runner: Option<u64>,
    ) -> Result<(), DeployError> {
        for (index, spec) in deployment.channels().iter().enumerate() {
            let role = match own_runner {
                Some(id) if spec.consumer == id => ChannelRole::Consumer,
                Some(id) if spec.producers.contains(&id) => ChannelRole::Producer,
                _ => ChannelRole::Bystander,
            };
            let channel =
                channel::establish(self.fabric.clone(), spec, index as u64, role).await?;
            self.channels.insert(Arc::new(channel));
        }
        Ok(())
    }

    /// Run the entry registered under `function` as runner `runner_id`.
    async fn run_entry(&self, function: &str, runner_id: u64) -> Result<(), DeployError> {
        let future = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(function)
                .ok_or_else(|| DeployError::UnknownFunction(function.to_string()))?;
            // Re-arm the context so the entry reads its own runner id even
            // on the coordinator, where no launch RPC was served.
            self.rpc.context().begin(runner_id);
            entry()
        };
        info!(runner = runner_id, function, "running entry");
        future.await;
        let _ = self.rpc.context().take_return();
        info!(runner = runner_id, function, "entry returned");
        Ok(())
    }
}

/// A runner resolved onto a concrete instance.
struct Assignment {
    runner_id: u64,
    function: String,
    instance: InstanceId,
}
