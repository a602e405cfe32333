//! # RPC Control Plane
//!
//! Named entry points over the fabric's request carriage. The control
//! plane keeps the target table (`name -> closure`), serves exactly one
//! inbound request per [`RpcEngine::listen`] call, and moves return-value
//! payloads back to the requester in a bincode-encoded envelope.
//!
//! Targets are synchronous closures that own their captures. They reach
//! the caller-supplied argument and the return-value side channel through
//! a shared [`RpcContext`] handle captured at registration time; there is
//! no process-global state.
//!
//! Ordering: requests from one caller to one target are served in call
//! order (inherited from the fabric), and concurrent requesters are
//! serialized one request per `listen` invocation.

use crate::error::DeployError;
use crate::fabric::{Fabric, InstanceId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type TargetFn = Box<dyn FnMut() + Send>;

/// Reply envelope moved over the wire for every served request.
#[derive(Serialize, Deserialize)]
enum ReplyEnvelope {
    /// The target ran; its submitted return value, if any.
    Return(Option<Vec<u8>>),
    /// The requested target name is not registered on the serving
    /// instance.
    UnknownTarget(String),
}

enum ReturnState {
    /// No invocation in flight.
    Idle,
    /// An invocation is running and may submit once.
    Armed,
    /// The running invocation has submitted its return value.
    Submitted(Vec<u8>),
}

/// Per-invocation context shared with target closures and entry functions.
///
/// Holds the caller-supplied integer argument of the invocation currently
/// being served and the at-most-once return-value cell.
pub struct RpcContext {
    argument: AtomicU64,
    ret: Mutex<ReturnState>,
}

impl RpcContext {
    fn new() -> Self {
        Self {
            argument: AtomicU64::new(0),
            ret: Mutex::new(ReturnState::Idle),
        }
    }

    /// The integer argument supplied by the caller of the current (or most
    /// recent) invocation. For dispatched runners this is the runner id.
    pub fn argument(&self) -> u64 {
        self.argument.load(Ordering::Acquire)
    }

    /// Declare the reply payload of the current invocation.
    ///
    /// Valid at most once per invocation; a second submission fails with
    /// `ReturnAlreadySubmitted`, as does submitting outside an invocation.
    pub fn submit_return_value(&self, payload: Vec<u8>) -> Result<(), DeployError> {
        let mut ret = self.ret.lock();
        match *ret {
            ReturnState::Armed => {
                *ret = ReturnState::Submitted(payload);
                Ok(())
            }
            _ => Err(DeployError::ReturnAlreadySubmitted),
        }
    }

    pub(crate) fn begin(&self, argument: u64) {
        self.argument.store(argument, Ordering::Release);
        *self.ret.lock() = ReturnState::Armed;
    }

    pub(crate) fn take_return(&self) -> Option<Vec<u8>> {
        match std::mem::replace(&mut *self.ret.lock(), ReturnState::Idle) {
            ReturnState::Submitted(payload) => Some(payload),
            _ => None,
        }
    }
}

/// A reply payload borrowed from a completed request.
///
/// The buffer stays valid until the value is dropped or explicitly
/// [released](ReturnBuffer::release).
#[derive(Debug)]
pub struct ReturnBuffer {
    payload: Option<Vec<u8>>,
}

impl ReturnBuffer {
    /// The reply payload, or `None` when the target submitted nothing.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Release the buffer.
    pub fn release(self) {}
}

/// The RPC engine of one instance: target table plus request/reply
/// plumbing over the fabric.
pub struct RpcEngine {
    fabric: Arc<dyn Fabric>,
    targets: Mutex<HashMap<String, TargetFn>>,
    context: Arc<RpcContext>,
}

impl RpcEngine {
    pub fn new(fabric: Arc<dyn Fabric>) -> Self {
        Self {
            fabric,
            targets: Mutex::new(HashMap::new()),
            context: Arc::new(RpcContext::new()),
        }
    }

    /// The context handle shared with target closures.
    pub fn context(&self) -> Arc<RpcContext> {
        self.context.clone()
    }

    /// Register a named target.
    ///
    /// Fails with `DuplicateName` if the name is taken; the table retains
    /// the first registration. The table must not be mutated once the
    /// deployment starts.
    pub fn register_target(
        &self,
        name: &str,
        target: impl FnMut() + Send + 'static,
    ) -> Result<(), DeployError> {
        match self.targets.lock().entry(name.to_string()) {
            Entry::Occupied(_) => Err(DeployError::DuplicateName(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Box::new(target));
                Ok(())
            }
        }
    }

    /// Serve exactly one inbound request.
    ///
    /// Blocks until a request arrives, runs the named target, transmits
    /// its return value (if any) back to the requester, and returns. A
    /// request for an unregistered name sends an `UnknownTarget` fault to
    /// the requester and surfaces `UnknownFunction` locally; the instance
    /// is free to keep listening.
    pub async fn listen(&self) -> Result<(), DeployError> {
        let request = self
            .fabric
            .next_request()
            .await
            .map_err(DeployError::transport)?;
        debug!(
            origin = request.origin,
            name = %request.name,
            arg = request.arg,
            "serving request"
        );

        self.context.begin(request.arg);
        let served = {
            let mut targets = self.targets.lock();
            match targets.get_mut(&request.name) {
                Some(target) => {
                    target();
                    true
                }
                None => false,
            }
        };
        let returned = self.context.take_return();

        let envelope = if served {
            ReplyEnvelope::Return(returned)
        } else {
            ReplyEnvelope::UnknownTarget(request.name.clone())
        };
        let encoded = bincode::serialize(&envelope)
            .map_err(|e| DeployError::transport(anyhow::Error::from(e)))?;
        self.fabric
            .post_reply(request.origin, encoded)
            .await
            .map_err(DeployError::transport)?;

        if served {
            Ok(())
        } else {
            Err(DeployError::UnknownFunction(request.name))
        }
    }

    /// Issue a request and block until the reply arrives.
    ///
    /// The reply payload is handed back as a [`ReturnBuffer`]. A fault
    /// reply surfaces as `UnknownFunction`.
    pub async fn request(
        &self,
        target: InstanceId,
        name: &str,
        arg: u64,
    ) -> Result<ReturnBuffer, DeployError> {
        debug!(target, name, arg, "posting request");
        self.fabric
            .post_request(target, name, arg)
            .await
            .map_err(DeployError::transport)?;
        let raw = self
            .fabric
            .wait_reply(target)
            .await
            .map_err(DeployError::transport)?;

        let envelope: ReplyEnvelope = bincode::deserialize(&raw)
            .map_err(|e| DeployError::transport(anyhow::Error::from(e)))?;
        match envelope {
            ReplyEnvelope::Return(payload) => Ok(ReturnBuffer { payload }),
            ReplyEnvelope::UnknownTarget(name) => Err(DeployError::UnknownFunction(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LocalFabric;
    use std::sync::atomic::AtomicUsize;

    fn pair() -> (RpcEngine, RpcEngine) {
        let mut group = LocalFabric::group(2);
        let b = Arc::new(group.pop().unwrap());
        let a = Arc::new(group.pop().unwrap());
        (RpcEngine::new(a), RpcEngine::new(b))
    }

    #[tokio::test]
    async fn round_trip_with_return_value() {
        let (client, server) = pair();

        let ctx = server.context();
        server
            .register_target("double", move || {
                let doubled = ctx.argument() * 2;
                ctx.submit_return_value(doubled.to_le_bytes().to_vec())
                    .unwrap();
            })
            .unwrap();

        let serving = tokio::spawn(async move {
            server.listen().await.unwrap();
        });

        let reply = client.request(1, "double", 21).await.unwrap();
        let bytes: [u8; 8] = reply.bytes().unwrap().try_into().unwrap();
        assert_eq!(u64::from_le_bytes(bytes), 42);
        reply.release();
        serving.await.unwrap();
    }

    /// Invariant: a second registration under the same name is rejected
    /// and the first closure keeps serving.
    #[tokio::test]
    async fn duplicate_registration_keeps_the_first_target() {
        let (client, server) = pair();

        let hits = Arc::new(AtomicUsize::new(0));
        let first = hits.clone();
        server
            .register_target("F", move || {
                first.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let err = server
            .register_target("F", move || panic!("second closure must never run"))
            .unwrap_err();
        assert!(matches!(err, DeployError::DuplicateName(name) if name == "F"));

        let serving = tokio::spawn(async move {
            server.listen().await.unwrap();
        });
        client.request(1, "F", 0).await.unwrap().release();
        serving.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_target_faults_both_sides() {
        let (client, server) = pair();

        let serving = tokio::spawn(async move {
            let err = server.listen().await.unwrap_err();
            assert!(matches!(err, DeployError::UnknownFunction(name) if name == "nope"));
        });

        let err = client.request(1, "nope", 0).await.unwrap_err();
        assert!(matches!(err, DeployError::UnknownFunction(name) if name == "nope"));
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn double_submission_is_rejected() {
        let (client, server) = pair();

        let ctx = server.context();
        server
            .register_target("once", move || {
                ctx.submit_return_value(b"first".to_vec()).unwrap();
                let err = ctx.submit_return_value(b"second".to_vec()).unwrap_err();
                assert!(matches!(err, DeployError::ReturnAlreadySubmitted));
            })
            .unwrap();

        let serving = tokio::spawn(async move {
            server.listen().await.unwrap();
        });
        let reply = client.request(1, "once", 0).await.unwrap();
        assert_eq!(reply.bytes(), Some(&b"first"[..]));
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn submitting_outside_an_invocation_fails() {
        let (engine, _peer) = pair();
        let err = engine
            .context()
            .submit_return_value(vec![1])
            .unwrap_err();
        assert!(matches!(err, DeployError::ReturnAlreadySubmitted));
    }
}
