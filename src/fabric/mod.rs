//! # Transport Fabric Abstraction
//!
//! This module defines the contract between the deployment core and the
//! transport backend, enabling the same coordinator, RPC and channel logic
//! to run over different fabrics. The core never talks to a concrete
//! backend; it only sees the [`Fabric`] trait.
//!
//! ## Capability Set
//!
//! A backend provides four capability groups:
//!
//! - **Identity**: the instance's own id, the root id, and the ordered
//!   group membership.
//! - **RPC carriage**: posting a named request with an integer argument to
//!   a peer, receiving inbound requests one at a time, and moving opaque
//!   reply payloads back. Delivery between one requester and one target is
//!   FIFO; the control plane on top relies on that.
//! - **Memory slots**: local slot allocation, a tagged collective exchange
//!   that publishes slots under small integer keys, a fence per tag, and
//!   remote read/write against published slots. This is what the channel
//!   engine builds its rings out of.
//! - **Mutual exclusion**: a distributed lock keyed by tag, used to
//!   serialize channel producers.
//!
//! ## Error Reporting
//!
//! Backends report through `anyhow::Result`; the core wraps every backend
//! failure in `DeployError::Transport` without interpreting it.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

pub mod local;

pub use local::LocalFabric;

/// Identifier of one addressable participant in the fabric group.
///
/// Opaque to the core: it is compared and passed back to the fabric, never
/// interpreted.
pub type InstanceId = u64;

/// One inbound RPC request, as handed out by [`Fabric::next_request`].
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// The instance that posted the request.
    pub origin: InstanceId,
    /// Name of the requested target.
    pub name: String,
    /// Caller-supplied integer argument.
    pub arg: u64,
}

/// Backing storage of one local memory slot.
///
/// The allocating instance reads and writes its slots directly; remote
/// peers reach them through [`Fabric::read_remote`] and
/// [`Fabric::write_remote`] once the slot has been published. The lock
/// only guards byte-level access; protocol-level exclusion (who may touch
/// which region when) is the caller's business, e.g. the channel engine's
/// distributed lock and single-consumer discipline.
pub struct SlotMemory {
    bytes: RwLock<Box<[u8]>>,
    len: usize,
}

impl SlotMemory {
    /// Allocate a zero-initialized slot of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; len].into_boxed_slice()),
            len,
        }
    }

    /// Slot size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the slot has zero size.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `dst.len()` bytes out of the slot starting at `offset`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(dst.len())
            .filter(|&e| e <= self.len)
            .ok_or_else(|| anyhow::anyhow!("slot read out of range"))?;
        dst.copy_from_slice(&self.bytes.read()[offset..end]);
        Ok(())
    }

    /// Copy `src` into the slot starting at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(src.len())
            .filter(|&e| e <= self.len)
            .ok_or_else(|| anyhow::anyhow!("slot write out of range"))?;
        self.bytes.write()[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Take a shared read guard over the whole slot.
    ///
    /// Used by the channel consumer to hand out borrowed views into its
    /// payload ring without copying.
    pub fn read_guard(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8]>> {
        self.bytes.read()
    }
}

/// Handle to a local memory slot owned by this instance.
pub struct SlotHandle {
    owner: InstanceId,
    id: u64,
    memory: Arc<SlotMemory>,
}

impl SlotHandle {
    pub(crate) fn new(owner: InstanceId, id: u64, memory: Arc<SlotMemory>) -> Self {
        Self { owner, id, memory }
    }

    /// The instance that allocated the slot.
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Fabric-local slot id, unique per owner.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The slot's backing storage.
    pub fn memory(&self) -> &SlotMemory {
        &self.memory
    }
}

/// Reference to a slot published in the global exchange, possibly owned by
/// a remote instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSlotRef {
    /// The instance owning the slot.
    pub owner: InstanceId,
    /// Slot id within the owner.
    pub id: u64,
    /// Slot size in bytes.
    pub len: usize,
}

/// The transport capability set consumed by the deployment core.
///
/// One `Fabric` value represents one instance's endpoint into the group.
/// The core drives it from a single cooperative task per instance and
/// never issues concurrent calls into it from that instance.
#[async_trait]
pub trait Fabric: Send + Sync {
    /// This instance's identifier.
    fn current_instance(&self) -> InstanceId;

    /// The identifier of the group's root instance.
    fn root_instance(&self) -> InstanceId;

    /// All instances of the group, in fabric order.
    fn instances(&self) -> Vec<InstanceId>;

    /// Post a named request with an integer argument to `target`.
    ///
    /// Returns once the request is handed to the fabric; completion of the
    /// remote target is observed through [`Fabric::wait_reply`].
    async fn post_request(&self, target: InstanceId, name: &str, arg: u64) -> Result<()>;

    /// Block until one inbound request arrives for this instance.
    async fn next_request(&self) -> Result<InboundRequest>;

    /// Send an opaque reply payload to `target`.
    async fn post_reply(&self, target: InstanceId, payload: Vec<u8>) -> Result<()>;

    /// Block until a reply arrives from `from` and return its payload.
    async fn wait_reply(&self, from: InstanceId) -> Result<Vec<u8>>;

    /// Allocate a zero-initialized local memory slot.
    fn allocate_slot(&self, len: usize) -> Result<SlotHandle>;

    /// Release a local memory slot. Remote references to it become
    /// invalid.
    fn free_slot(&self, slot: &SlotHandle) -> Result<()>;

    /// Publish local slots into the global exchange under `(tag, key)`
    /// pairs. Peers may resolve them after the matching [`Fabric::fence`].
    async fn publish_slots(&self, tag: u64, entries: &[(u32, &SlotHandle)]) -> Result<()>;

    /// Collective fence: blocks until every instance of the group has
    /// entered the fence for `tag`.
    async fn fence(&self, tag: u64) -> Result<()>;

    /// Resolve a slot published under `(tag, key)`.
    async fn lookup_slot(&self, tag: u64, key: u32) -> Result<RemoteSlotRef>;

    /// Copy bytes out of a published slot into `dst`.
    async fn read_remote(&self, slot: &RemoteSlotRef, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into a published slot.
    async fn write_remote(&self, slot: &RemoteSlotRef, offset: usize, src: &[u8]) -> Result<()>;

    /// Acquire the distributed lock for `tag`, blocking until granted.
    async fn acquire_lock(&self, tag: u64) -> Result<()>;

    /// Release the distributed lock for `tag`. Releasing a lock this
    /// instance does not hold is a no-op.
    fn release_lock(&self, tag: u64);

    /// Abort the whole group: peers blocked in fabric calls are unblocked
    /// with an error.
    async fn abort(&self, code: i32);

    /// Release this instance's fabric resources.
    async fn finalize(&self) -> Result<()>;
}

/// Selector for the concrete fabric backend, decided at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FabricKind {
    /// In-process fabric: one cooperative task per instance within this
    /// process, queues for RPC carriage, shared memory for slots.
    #[value(name = "local")]
    Local,
}

impl std::fmt::Display for FabricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FabricKind::Local => write!(f, "local"),
        }
    }
}

impl FabricKind {
    /// Construct a fabric group of `count` instances.
    pub fn build_group(&self, count: usize) -> Result<Vec<Arc<dyn Fabric>>> {
        match self {
            FabricKind::Local => Ok(LocalFabric::group(count)
                .into_iter()
                .map(|f| Arc::new(f) as Arc<dyn Fabric>)
                .collect()),
        }
    }
}
