//! # Variable-Sized MPSC Channel Engine
//!
//! A bounded multi-producer single-consumer queue of variable-sized
//! tokens, built from the fabric's global memory slots so that a `push`
//! costs remote memory traffic but no extra control messages.
//!
//! ## Ring Protocol
//!
//! The consumer owns four slots, published in the global exchange under
//! reserved keys:
//!
//! - a **sizes ring** of `capacity` entries, each `(offset, len)`;
//! - a **payload ring** of `payload_bytes` bytes;
//! - two **coordination cells**, one for the sizes ring and one for the
//!   payload ring, each holding a pair of monotonic `u64` counters:
//!   a head advanced by producers and a tail advanced by the consumer.
//!
//! Counters never wrap; ring positions are derived as `counter % size` at
//! access time. Each counter half has exactly one writing side: producers
//! advance heads (serialized by the channel's distributed lock), the
//! consumer advances tails. The head halves are written only under the
//! lock, so producers always observe each other's published state.
//!
//! Tokens are stored contiguously in the payload ring. A token that would
//! cross the ring end is placed at offset zero instead and the skipped
//! tail gap is accounted in the payload counters; the sizes-ring entry
//! carries the explicit offset so `peek` can hand out one borrowed slice.
//!
//! ## Ordering
//!
//! Per producer, tokens appear in push order. Across producers the order
//! is whatever the distributed lock serializes; tokens are never
//! interleaved within one token.

use crate::deployment::ChannelSpec;
use crate::error::DeployError;
use crate::fabric::{Fabric, RemoteSlotRef, SlotHandle};
use parking_lot::{MappedRwLockReadGuard, RwLockReadGuard};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Reserved exchange key of the sizes ring.
pub const KEY_SIZES: u32 = 0;
/// Reserved exchange key of the sizes coordination cell.
pub const KEY_COORD_SIZES: u32 = 3;
/// Reserved exchange key of the payload coordination cell.
pub const KEY_COORD_PAYLOADS: u32 = 4;
/// Reserved exchange key of the payload ring.
pub const KEY_PAYLOAD: u32 = 5;

/// Bytes of one coordination cell: head and tail counters.
const COORD_BYTES: usize = 16;
/// Bytes of one sizes-ring entry: offset and length.
const SIZE_ENTRY_BYTES: usize = 16;

/// This instance's side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// May push.
    Producer,
    /// May peek and pop.
    Consumer,
    /// Participates in the handshake only.
    Bystander,
}

fn decode_pair(bytes: [u8; 16]) -> (u64, u64) {
    let head = u64::from_le_bytes(bytes[..8].try_into().expect("split at 8"));
    let tail = u64::from_le_bytes(bytes[8..].try_into().expect("split at 8"));
    (head, tail)
}

fn encode_pair(head: u64, tail: u64) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&head.to_le_bytes());
    bytes[8..].copy_from_slice(&tail.to_le_bytes());
    bytes
}

/// Producer-side state: remote references to the consumer's slots plus the
/// local mirror and staging slots allocated during the handshake.
struct ProducerSide {
    sizes: RemoteSlotRef,
    payload: RemoteSlotRef,
    coord_sizes: RemoteSlotRef,
    coord_payloads: RemoteSlotRef,
    coord_sizes_mirror: SlotHandle,
    coord_payloads_mirror: SlotHandle,
    size_info: SlotHandle,
}

impl ProducerSide {
    /// Refresh one local coordination mirror from its remote master and
    /// return the decoded counters.
    async fn refresh(
        &self,
        fabric: &Arc<dyn Fabric>,
        remote: &RemoteSlotRef,
        mirror: &SlotHandle,
    ) -> Result<(u64, u64), DeployError> {
        let mut cell = [0u8; COORD_BYTES];
        fabric
            .read_remote(remote, 0, &mut cell)
            .await
            .map_err(DeployError::transport)?;
        mirror
            .memory()
            .write_at(0, &cell)
            .map_err(DeployError::transport)?;
        Ok(decode_pair(cell))
    }
}

/// Consumer-side state: the four owned slots.
struct ConsumerSide {
    sizes: SlotHandle,
    payload: SlotHandle,
    coord_sizes: SlotHandle,
    coord_payloads: SlotHandle,
}

impl ConsumerSide {
    fn counters(&self, cell: &SlotHandle) -> Result<(u64, u64), DeployError> {
        let mut bytes = [0u8; COORD_BYTES];
        cell.memory()
            .read_at(0, &mut bytes)
            .map_err(DeployError::transport)?;
        Ok(decode_pair(bytes))
    }

    fn entry(&self, index: u64, capacity: u64) -> Result<(u64, u64), DeployError> {
        let mut bytes = [0u8; SIZE_ENTRY_BYTES];
        self.sizes
            .memory()
            .read_at((index % capacity) as usize * SIZE_ENTRY_BYTES, &mut bytes)
            .map_err(DeployError::transport)?;
        Ok(decode_pair(bytes))
    }

    fn advance_tail(&self, cell: &SlotHandle, tail: u64) -> Result<(), DeployError> {
        cell.memory()
            .write_at(8, &tail.to_le_bytes())
            .map_err(DeployError::transport)
    }
}

enum Side {
    Producer(AsyncMutex<ProducerSide>),
    Consumer(ConsumerSide),
    Bystander,
}

/// A borrowed view of the token at the head of the queue.
///
/// Points into the consumer's payload ring; valid until the matching
/// [`Channel::pop`]. Drop the token before popping.
pub struct Token<'a> {
    bytes: MappedRwLockReadGuard<'a, [u8]>,
}

impl Deref for Token<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

/// One instance's handle onto an established channel.
pub struct Channel {
    name: String,
    tag: u64,
    capacity: u64,
    payload_bytes: u64,
    fabric: Arc<dyn Fabric>,
    side: Side,
}

impl Channel {
    /// The channel name from the deployment description.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This instance's role on the channel.
    pub fn role(&self) -> ChannelRole {
        match self.side {
            Side::Producer(_) => ChannelRole::Producer,
            Side::Consumer(_) => ChannelRole::Consumer,
            Side::Bystander => ChannelRole::Bystander,
        }
    }

    /// Maximum number of pending tokens.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Payload ring size in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes as usize
    }

    /// Push one token. Producer side only.
    ///
    /// Non-blocking with respect to the consumer: once the channel's
    /// distributed lock is held, the push either completes or fails with
    /// `WouldBlock` when the token count is at capacity or the payload
    /// ring cannot take `payload.len()` more bytes.
    pub async fn push(&self, payload: &[u8]) -> Result<(), DeployError> {
        let Side::Producer(state) = &self.side else {
            return Err(DeployError::WrongRole);
        };
        let side = state.lock().await;

        self.fabric
            .acquire_lock(self.tag)
            .await
            .map_err(DeployError::transport)?;
        let result = self.push_locked(&side, payload).await;
        self.fabric.release_lock(self.tag);
        result
    }

    async fn push_locked(&self, side: &ProducerSide, payload: &[u8]) -> Result<(), DeployError> {
        let (size_head, size_tail) = side
            .refresh(&self.fabric, &side.coord_sizes, &side.coord_sizes_mirror)
            .await?;
        debug_assert!(size_head - size_tail <= self.capacity);
        if size_head - size_tail == self.capacity {
            return Err(DeployError::WouldBlock);
        }

        let (pay_head, pay_tail) = side
            .refresh(
                &self.fabric,
                &side.coord_payloads,
                &side.coord_payloads_mirror,
            )
            .await?;
        let free = self.payload_bytes - (pay_head - pay_tail);
        let len = payload.len() as u64;
        let head_offset = pay_head % self.payload_bytes;

        // Keep the token contiguous: skip the tail gap when it would
        // cross the ring end. The gap bytes count as used until the
        // matching pop reclaims them.
        let (offset, consumed) = if head_offset + len <= self.payload_bytes {
            (head_offset, len)
        } else {
            (0, self.payload_bytes - head_offset + len)
        };
        if free < consumed {
            return Err(DeployError::WouldBlock);
        }

        if len > 0 {
            self.fabric
                .write_remote(&side.payload, offset as usize, payload)
                .await
                .map_err(DeployError::transport)?;
        }

        // Stage the size entry locally, then publish it and advance the
        // heads. The sizes head goes last; the consumer keys off it.
        let entry = encode_pair(offset, len);
        side.size_info
            .memory()
            .write_at(0, &entry)
            .map_err(DeployError::transport)?;
        self.fabric
            .write_remote(
                &side.sizes,
                (size_head % self.capacity) as usize * SIZE_ENTRY_BYTES,
                &entry,
            )
            .await
            .map_err(DeployError::transport)?;
        self.fabric
            .write_remote(&side.coord_payloads, 0, &(pay_head + consumed).to_le_bytes())
            .await
            .map_err(DeployError::transport)?;
        self.fabric
            .write_remote(&side.coord_sizes, 0, &(size_head + 1).to_le_bytes())
            .await
            .map_err(DeployError::transport)?;

        debug!(channel = %self.name, len, offset, "pushed token");
        Ok(())
    }

    /// Borrow the token at the head of the queue. Consumer side only.
    ///
    /// Never blocks; fails with `Empty` when no token is pending. The
    /// returned [`Token`] stays valid until the matching [`Channel::pop`].
    pub fn peek(&self) -> Result<Token<'_>, DeployError> {
        let Side::Consumer(side) = &self.side else {
            return Err(DeployError::WrongRole);
        };

        let (head, tail) = side.counters(&side.coord_sizes)?;
        if head == tail {
            return Err(DeployError::Empty);
        }
        let (offset, len) = side.entry(tail, self.capacity)?;
        debug_assert!(offset + len <= self.payload_bytes);

        let guard = side.payload.memory().read_guard();
        let bytes = RwLockReadGuard::map(guard, |all| &all[offset as usize..(offset + len) as usize]);
        Ok(Token { bytes })
    }

    /// Drop the token at the head of the queue. Consumer side only.
    ///
    /// Never blocks; fails with `Empty` when no token is pending.
    pub fn pop(&self) -> Result<(), DeployError> {
        let Side::Consumer(side) = &self.side else {
            return Err(DeployError::WrongRole);
        };

        let (head, tail) = side.counters(&side.coord_sizes)?;
        if head == tail {
            return Err(DeployError::Empty);
        }
        let (offset, len) = side.entry(tail, self.capacity)?;

        // Reclaim the token plus any gap the producer skipped to keep it
        // contiguous.
        let (pay_head, pay_tail) = side.counters(&side.coord_payloads)?;
        let tail_offset = pay_tail % self.payload_bytes;
        let gap = (offset + self.payload_bytes - tail_offset) % self.payload_bytes;
        debug_assert!(gap + len <= pay_head - pay_tail);

        side.advance_tail(&side.coord_payloads, pay_tail + gap + len)?;
        side.advance_tail(&side.coord_sizes, tail + 1)?;
        debug!(channel = %self.name, len, "popped token");
        Ok(())
    }

    /// Free the slots allocated for this channel during the handshake.
    ///
    /// Called by the runtime on finalize; errors are ignored because the
    /// fabric may already have torn the group down.
    pub(crate) fn release_slots(&self) {
        let free = |slot: &SlotHandle| {
            if let Err(e) = self.fabric.free_slot(slot) {
                debug!(channel = %self.name, "slot release skipped: {e}");
            }
        };
        match &self.side {
            Side::Producer(state) => {
                if let Ok(side) = state.try_lock() {
                    free(&side.coord_sizes_mirror);
                    free(&side.coord_payloads_mirror);
                    free(&side.size_info);
                }
            }
            Side::Consumer(side) => {
                free(&side.sizes);
                free(&side.payload);
                free(&side.coord_sizes);
                free(&side.coord_payloads);
            }
            Side::Bystander => {}
        }
    }
}

/// Run the collective handshake for one channel and build this instance's
/// handle.
///
/// Every instance of the group must call this with the same `tag`, in the
/// same channel order, regardless of role: the handshake ends in a fence
/// that the transport may implement as a single barrier. A transport
/// failure here is fatal and aborts the group.
pub(crate) async fn establish(
    fabric: Arc<dyn Fabric>,
    spec: &ChannelSpec,
    tag: u64,
    role: ChannelRole,
) -> Result<Channel, DeployError> {
    debug!(channel = %spec.name, tag, ?role, "establishing channel");
    let capacity = spec.capacity as u64;
    let payload_bytes = spec.payload_bytes as u64;

    let side = match role {
        ChannelRole::Consumer => {
            let sizes = fatal(&fabric, fabric.allocate_slot(spec.capacity * SIZE_ENTRY_BYTES)).await?;
            let payload = fatal(&fabric, fabric.allocate_slot(spec.payload_bytes)).await?;
            // Slots come back zeroed, which is exactly the initial
            // counter state.
            let coord_sizes = fatal(&fabric, fabric.allocate_slot(COORD_BYTES)).await?;
            let coord_payloads = fatal(&fabric, fabric.allocate_slot(COORD_BYTES)).await?;

            let published = fabric
                .publish_slots(
                    tag,
                    &[
                        (KEY_SIZES, &sizes),
                        (KEY_COORD_SIZES, &coord_sizes),
                        (KEY_COORD_PAYLOADS, &coord_payloads),
                        (KEY_PAYLOAD, &payload),
                    ],
                )
                .await;
            fatal(&fabric, published).await?;
            fatal(&fabric, fabric.fence(tag).await).await?;

            Side::Consumer(ConsumerSide {
                sizes,
                payload,
                coord_sizes,
                coord_payloads,
            })
        }
        ChannelRole::Producer => {
            let coord_sizes_mirror = fatal(&fabric, fabric.allocate_slot(COORD_BYTES)).await?;
            let coord_payloads_mirror = fatal(&fabric, fabric.allocate_slot(COORD_BYTES)).await?;
            let size_info = fatal(&fabric, fabric.allocate_slot(SIZE_ENTRY_BYTES)).await?;

            fatal(&fabric, fabric.fence(tag).await).await?;

            let sizes = fatal(&fabric, fabric.lookup_slot(tag, KEY_SIZES).await).await?;
            let payload = fatal(&fabric, fabric.lookup_slot(tag, KEY_PAYLOAD).await).await?;
            let coord_sizes = fatal(&fabric, fabric.lookup_slot(tag, KEY_COORD_SIZES).await).await?;
            let coord_payloads =
                fatal(&fabric, fabric.lookup_slot(tag, KEY_COORD_PAYLOADS).await).await?;

            Side::Producer(AsyncMutex::new(ProducerSide {
                sizes,
                payload,
                coord_sizes,
                coord_payloads,
                coord_sizes_mirror,
                coord_payloads_mirror,
                size_info,
            }))
        }
        ChannelRole::Bystander => {
            fatal(&fabric, fabric.fence(tag).await).await?;
            Side::Bystander
        }
    };

    Ok(Channel {
        name: spec.name.clone(),
        tag,
        capacity,
        payload_bytes,
        fabric,
        side,
    })
}

/// Wrap a fabric result from the handshake's fatal phase: any failure
/// aborts the group before propagating.
async fn fatal<T>(fabric: &Arc<dyn Fabric>, result: anyhow::Result<T>) -> Result<T, DeployError> {
    match result {
        Ok(value) => Ok(value),
        Err(e) => {
            fabric.abort(1).await;
            Err(DeployError::transport(e))
        }
    }
}

/// The channels established for the current deployment, keyed by name.
///
/// Entry functions capture a handle to this set at registration time and
/// resolve their channels once they run.
#[derive(Default)]
pub struct ChannelSet {
    inner: parking_lot::RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an established channel by name.
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.inner.read().get(name).cloned()
    }

    /// Names of all established channels.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub(crate) fn insert(&self, channel: Arc<Channel>) {
        self.inner.write().insert(channel.name().to_string(), channel);
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Channel>> {
        self.inner.write().drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LocalFabric;

    fn spec(capacity: usize, payload_bytes: usize) -> ChannelSpec {
        ChannelSpec {
            name: "data".to_string(),
            producers: vec![0],
            consumer: 1,
            capacity,
            payload_bytes,
        }
    }

    /// Establish one channel between a producer and a consumer endpoint.
    async fn producer_consumer(
        capacity: usize,
        payload_bytes: usize,
    ) -> (Channel, Channel) {
        let mut group = LocalFabric::group(2);
        let consumer_fabric: Arc<dyn Fabric> = Arc::new(group.pop().unwrap());
        let producer_fabric: Arc<dyn Fabric> = Arc::new(group.pop().unwrap());
        let spec = spec(capacity, payload_bytes);

        let consumer_spec = spec.clone();
        let consumer = tokio::spawn(async move {
            establish(consumer_fabric, &consumer_spec, 0, ChannelRole::Consumer).await
        });
        let producer = establish(producer_fabric, &spec, 0, ChannelRole::Producer)
            .await
            .unwrap();
        (producer, consumer.await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn fills_drains_and_refills() {
        let (producer, consumer) = producer_consumer(2, 16).await;

        producer.push(b"hi").await.unwrap();
        producer.push(b"world").await.unwrap();
        // Two tokens pending: the capacity is exhausted.
        assert!(matches!(
            producer.push(b"!").await,
            Err(DeployError::WouldBlock)
        ));

        {
            let token = consumer.peek().unwrap();
            assert_eq!(&*token, b"hi");
        }
        consumer.pop().unwrap();

        producer.push(b"!").await.unwrap();
        let token = consumer.peek().unwrap();
        assert_eq!(&*token, b"world");
    }

    #[tokio::test]
    async fn payload_exhaustion_blocks_before_capacity() {
        let (producer, consumer) = producer_consumer(8, 8).await;

        producer.push(b"abcde").await.unwrap();
        // Five of eight payload bytes are taken; a four-byte token cannot
        // fit even though the sizes ring has room.
        assert!(matches!(
            producer.push(b"wxyz").await,
            Err(DeployError::WouldBlock)
        ));

        consumer.pop().unwrap();
        producer.push(b"wxyz").await.unwrap();
        assert_eq!(&*consumer.peek().unwrap(), b"wxyz");
    }

    #[tokio::test]
    async fn tokens_stay_contiguous_across_the_ring_end() {
        let (producer, consumer) = producer_consumer(4, 8).await;

        producer.push(b"abcdef").await.unwrap();
        consumer.pop().unwrap();
        // The head offset is now 6 of 8; a three-byte token must skip the
        // two-byte gap and land at offset zero.
        producer.push(b"xyz").await.unwrap();

        let token = consumer.peek().unwrap();
        assert_eq!(&*token, b"xyz");
        drop(token);
        consumer.pop().unwrap();

        // The ring is drained; the remaining contiguous stretch up to the
        // ring end is available again.
        producer.push(b"12345").await.unwrap();
        assert_eq!(&*consumer.peek().unwrap(), b"12345");
    }

    #[tokio::test]
    async fn single_producer_order_is_preserved() {
        let (producer, consumer) = producer_consumer(4, 64).await;

        let tokens: &[&[u8]] = &[b"alpha", b"beta", b"gamma", b"delta"];
        for token in tokens {
            producer.push(token).await.unwrap();
        }
        for expected in tokens {
            let token = consumer.peek().unwrap();
            assert_eq!(&*token, *expected);
            drop(token);
            consumer.pop().unwrap();
        }
        assert!(matches!(consumer.peek(), Err(DeployError::Empty)));
        assert!(matches!(consumer.pop(), Err(DeployError::Empty)));
    }

    #[tokio::test]
    async fn roles_are_enforced() {
        let (producer, consumer) = producer_consumer(2, 16).await;

        assert!(matches!(producer.peek(), Err(DeployError::WrongRole)));
        assert!(matches!(producer.pop(), Err(DeployError::WrongRole)));
        assert!(matches!(
            consumer.push(b"x").await,
            Err(DeployError::WrongRole)
        ));
    }

    #[tokio::test]
    async fn oversized_token_is_refused() {
        let (producer, _consumer) = producer_consumer(2, 8).await;
        assert!(matches!(
            producer.push(b"123456789").await,
            Err(DeployError::WouldBlock)
        ));
    }
}
