//! In-process fabric backend: the whole group lives in one process, one
//! cooperative task per instance. RPC carriage rides on unbounded queues,
//! memory slots are shared allocations reached through a group-wide
//! registry, fences are reusable barriers, and the distributed lock is an
//! async mutex per tag.
//!
//! This is the reference backend used by the demo binary and the test
//! suite; a message-passing backend would implement the same trait over a
//! real wire.

use super::{Fabric, InboundRequest, InstanceId, RemoteSlotRef, SlotHandle, SlotMemory};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Barrier, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

enum RequestMsg {
    Rpc(InboundRequest),
    Abort(i32),
}

enum ReplyMsg {
    Reply { origin: InstanceId, payload: Vec<u8> },
    Abort(i32),
}

/// State shared by every endpoint of one group.
struct Shared {
    group_size: usize,
    request_txs: Vec<UnboundedSender<RequestMsg>>,
    reply_txs: Vec<UnboundedSender<ReplyMsg>>,
    slots: Mutex<HashMap<(InstanceId, u64), Arc<SlotMemory>>>,
    published: Mutex<HashMap<(u64, u32), RemoteSlotRef>>,
    fences: Mutex<HashMap<u64, Arc<Barrier>>>,
    locks: Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
    aborted: AtomicBool,
}

impl Shared {
    fn check_alive(&self) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(anyhow!("fabric group was aborted"));
        }
        Ok(())
    }

    fn resolve(&self, slot: &RemoteSlotRef) -> Result<Arc<SlotMemory>> {
        self.slots
            .lock()
            .get(&(slot.owner, slot.id))
            .cloned()
            .ok_or_else(|| anyhow!("slot {} of instance {} is not allocated", slot.id, slot.owner))
    }

    fn barrier(&self, tag: u64) -> Arc<Barrier> {
        self.fences
            .lock()
            .entry(tag)
            .or_insert_with(|| Arc::new(Barrier::new(self.group_size)))
            .clone()
    }

    fn lock_for(&self, tag: u64) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(tag)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// One instance's endpoint into an in-process fabric group.
pub struct LocalFabric {
    id: InstanceId,
    shared: Arc<Shared>,
    requests: AsyncMutex<UnboundedReceiver<RequestMsg>>,
    replies: AsyncMutex<UnboundedReceiver<ReplyMsg>>,
    next_slot_id: AtomicU64,
    held_locks: Mutex<HashMap<u64, OwnedMutexGuard<()>>>,
}

impl LocalFabric {
    /// Create a group of `count` endpoints with instance ids `0..count`.
    pub fn group(count: usize) -> Vec<LocalFabric> {
        assert!(count > 0, "a fabric group needs at least one instance");

        let mut request_txs = Vec::with_capacity(count);
        let mut request_rxs = Vec::with_capacity(count);
        let mut reply_txs = Vec::with_capacity(count);
        let mut reply_rxs = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = unbounded_channel();
            request_txs.push(tx);
            request_rxs.push(rx);
            let (tx, rx) = unbounded_channel();
            reply_txs.push(tx);
            reply_rxs.push(rx);
        }

        let shared = Arc::new(Shared {
            group_size: count,
            request_txs,
            reply_txs,
            slots: Mutex::new(HashMap::new()),
            published: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            aborted: AtomicBool::new(false),
        });

        request_rxs
            .into_iter()
            .zip(reply_rxs)
            .enumerate()
            .map(|(id, (requests, replies))| LocalFabric {
                id: id as InstanceId,
                shared: shared.clone(),
                requests: AsyncMutex::new(requests),
                replies: AsyncMutex::new(replies),
                next_slot_id: AtomicU64::new(0),
                held_locks: Mutex::new(HashMap::new()),
            })
            .collect()
    }

    fn request_tx(&self, target: InstanceId) -> Result<&UnboundedSender<RequestMsg>> {
        self.shared
            .request_txs
            .get(target as usize)
            .ok_or_else(|| anyhow!("instance {target} is not part of the group"))
    }

    fn reply_tx(&self, target: InstanceId) -> Result<&UnboundedSender<ReplyMsg>> {
        self.shared
            .reply_txs
            .get(target as usize)
            .ok_or_else(|| anyhow!("instance {target} is not part of the group"))
    }
}

#[async_trait]
impl Fabric for LocalFabric {
    fn current_instance(&self) -> InstanceId {
        self.id
    }

    fn root_instance(&self) -> InstanceId {
        0
    }

    fn instances(&self) -> Vec<InstanceId> {
        (0..self.shared.group_size as InstanceId).collect()
    }

    async fn post_request(&self, target: InstanceId, name: &str, arg: u64) -> Result<()> {
        self.shared.check_alive()?;
        let request = InboundRequest {
            origin: self.id,
            name: name.to_string(),
            arg,
        };
        self.request_tx(target)?
            .send(RequestMsg::Rpc(request))
            .map_err(|_| anyhow!("instance {target} is gone"))
    }

    async fn next_request(&self) -> Result<InboundRequest> {
        let mut requests = self.requests.lock().await;
        match requests.recv().await {
            Some(RequestMsg::Rpc(request)) => Ok(request),
            Some(RequestMsg::Abort(code)) => Err(anyhow!("fabric group aborted with code {code}")),
            None => Err(anyhow!("fabric group torn down")),
        }
    }

    async fn post_reply(&self, target: InstanceId, payload: Vec<u8>) -> Result<()> {
        self.shared.check_alive()?;
        self.reply_tx(target)?
            .send(ReplyMsg::Reply {
                origin: self.id,
                payload,
            })
            .map_err(|_| anyhow!("instance {target} is gone"))
    }

    async fn wait_reply(&self, from: InstanceId) -> Result<Vec<u8>> {
        let mut replies = self.replies.lock().await;
        match replies.recv().await {
            Some(ReplyMsg::Reply { origin, payload }) => {
                if origin != from {
                    // One outstanding request at a time per instance; a
                    // reply from anyone else is a protocol violation.
                    return Err(anyhow!(
                        "expected a reply from instance {from}, got one from {origin}"
                    ));
                }
                Ok(payload)
            }
            Some(ReplyMsg::Abort(code)) => Err(anyhow!("fabric group aborted with code {code}")),
            None => Err(anyhow!("fabric group torn down")),
        }
    }

    fn allocate_slot(&self, len: usize) -> Result<SlotHandle> {
        self.shared.check_alive()?;
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let memory = Arc::new(SlotMemory::new(len));
        self.shared
            .slots
            .lock()
            .insert((self.id, id), memory.clone());
        Ok(SlotHandle::new(self.id, id, memory))
    }

    fn free_slot(&self, slot: &SlotHandle) -> Result<()> {
        if slot.owner() != self.id {
            return Err(anyhow!("slot {} is owned by instance {}", slot.id(), slot.owner()));
        }
        self.shared
            .slots
            .lock()
            .remove(&(self.id, slot.id()))
            .map(|_| ())
            .ok_or_else(|| anyhow!("slot {} was already freed", slot.id()))
    }

    async fn publish_slots(&self, tag: u64, entries: &[(u32, &SlotHandle)]) -> Result<()> {
        self.shared.check_alive()?;
        let mut published = self.shared.published.lock();
        for (key, slot) in entries {
            published.insert(
                (tag, *key),
                RemoteSlotRef {
                    owner: slot.owner(),
                    id: slot.id(),
                    len: slot.memory().len(),
                },
            );
        }
        Ok(())
    }

    async fn fence(&self, tag: u64) -> Result<()> {
        self.shared.check_alive()?;
        debug!(instance = self.id, tag, "entering fence");
        self.shared.barrier(tag).wait().await;
        self.shared.check_alive()
    }

    async fn lookup_slot(&self, tag: u64, key: u32) -> Result<RemoteSlotRef> {
        self.shared
            .published
            .lock()
            .get(&(tag, key))
            .cloned()
            .ok_or_else(|| anyhow!("no slot published under tag {tag}, key {key}"))
    }

    async fn read_remote(&self, slot: &RemoteSlotRef, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.shared.resolve(slot)?.read_at(offset, dst)
    }

    async fn write_remote(&self, slot: &RemoteSlotRef, offset: usize, src: &[u8]) -> Result<()> {
        self.shared.resolve(slot)?.write_at(offset, src)
    }

    async fn acquire_lock(&self, tag: u64) -> Result<()> {
        self.shared.check_alive()?;
        let guard = self.shared.lock_for(tag).lock_owned().await;
        self.held_locks.lock().insert(tag, guard);
        Ok(())
    }

    fn release_lock(&self, tag: u64) {
        self.held_locks.lock().remove(&tag);
    }

    async fn abort(&self, code: i32) {
        if self.shared.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(instance = self.id, code, "aborting fabric group");
        for tx in &self.shared.request_txs {
            let _ = tx.send(RequestMsg::Abort(code));
        }
        for tx in &self.shared.reply_txs {
            let _ = tx.send(ReplyMsg::Abort(code));
        }
    }

    async fn finalize(&self) -> Result<()> {
        self.held_locks.lock().clear();
        self.shared
            .slots
            .lock()
            .retain(|(owner, _), _| *owner != self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn request_reply_round_trip() {
        let mut group = LocalFabric::group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        let server = tokio::spawn(async move {
            let request = b.next_request().await.unwrap();
            assert_eq!(request.origin, 0);
            assert_eq!(request.name, "ping");
            assert_eq!(request.arg, 7);
            b.post_reply(request.origin, vec![1, 2, 3]).await.unwrap();
        });

        a.post_request(1, "ping", 7).await.unwrap();
        let payload = a.wait_reply(1).await.unwrap();
        assert_eq!(payload, vec![1, 2, 3]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn requests_from_one_caller_stay_ordered() {
        let mut group = LocalFabric::group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        for i in 0..4u64 {
            a.post_request(1, "seq", i).await.unwrap();
        }
        for i in 0..4u64 {
            let request = b.next_request().await.unwrap();
            assert_eq!(request.arg, i);
        }
    }

    #[tokio::test]
    async fn published_slots_are_visible_after_fence() {
        let mut group = LocalFabric::group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        let owner = tokio::spawn(async move {
            let slot = a.allocate_slot(16).unwrap();
            slot.memory().write_at(0, b"hello").unwrap();
            a.publish_slots(9, &[(0, &slot)]).await.unwrap();
            a.fence(9).await.unwrap();
            // Keep the slot alive until the peer has read it.
            a.fence(10).await.unwrap();
            a.free_slot(&slot).unwrap();
        });

        b.fence(9).await.unwrap();
        let remote = b.lookup_slot(9, 0).await.unwrap();
        assert_eq!(remote.owner, 0);
        assert_eq!(remote.len, 16);

        let mut out = [0u8; 5];
        b.read_remote(&remote, 0, &mut out).await.unwrap();
        assert_eq!(&out, b"hello");

        b.write_remote(&remote, 8, b"back").await.unwrap();
        b.fence(10).await.unwrap();
        owner.await.unwrap();

        // The owner freed the slot; remote access now fails.
        assert!(b.read_remote(&remote, 0, &mut out).await.is_err());
    }

    #[tokio::test]
    async fn distributed_lock_is_exclusive() {
        let mut group = LocalFabric::group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        a.acquire_lock(3).await.unwrap();

        let contender = tokio::spawn(async move {
            b.acquire_lock(3).await.unwrap();
            b.release_lock(3);
            b
        });

        // The contender cannot get the lock while we hold it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        a.release_lock(3);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn abort_unblocks_a_parked_listener() {
        let mut group = LocalFabric::group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        let parked = tokio::spawn(async move { b.next_request().await });
        a.abort(2).await;

        let result = parked.await.unwrap();
        assert!(result.is_err());
    }
}
