//! Call correlation across the script boundary.
//!
//! Script code cannot block, so every asynchronous bridge call carries an
//! integer callback id minted on the script side. The native side turns an
//! accepted id into a [`PendingCall`] token that is consumed by exactly one
//! invocation, and marshals that invocation back onto the resolver's script
//! thread.
//!
//! The reverse direction (native code calling into a script function and
//! waiting for its answer) uses [`NativeCallTable`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::engine::{EngineMessage, ScriptThreadHandle};
use crate::lock;

/// Opaque id of a script-side continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackHandle(i64);

impl CallbackHandle {
    /// Interpret a wire id. Missing or negative ids mean "no callback".
    pub fn from_wire(id: Option<i64>) -> Option<Self> {
        id.filter(|id| *id >= 0).map(Self)
    }

    pub fn id(self) -> i64 {
        self.0
    }
}

/// Which continuation of an async call is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackOutcome {
    Success,
    Error,
}

/// Response data handed to a script continuation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpReply {
    pub response_text: String,
    pub response_headers: HashMap<String, Vec<String>>,
    pub status: u16,
    pub status_text: String,
}

/// A single call back into script code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackInvocation {
    pub id: i64,
    pub outcome: CallbackOutcome,
    #[serde(flatten)]
    pub reply: HttpReply,
}

// ─── Registry ───────────────────────────────────────────────────────────

/// Table of outstanding script continuations for one resolver.
pub struct CallbackRegistry {
    resolver: String,
    /// Callback id → time it was accepted.
    pending: Mutex<HashMap<i64, Instant>>,
    script: ScriptThreadHandle,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("resolver", &self.resolver)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl CallbackRegistry {
    pub fn new(resolver: impl Into<String>, script: ScriptThreadHandle) -> Arc<Self> {
        Arc::new(Self {
            resolver: resolver.into(),
            pending: Mutex::new(HashMap::new()),
            script,
        })
    }

    /// Accept a handle for an async call that is about to be dispatched.
    ///
    /// Accepting an id that is still outstanding refreshes it; the script
    /// side is responsible for not reusing ids.
    pub fn accept(self: &Arc<Self>, handle: CallbackHandle) -> PendingCall {
        let previous = lock(&self.pending).insert(handle.id(), Instant::now());
        if previous.is_some() {
            tracing::debug!(
                resolver = %self.resolver,
                callback_id = handle.id(),
                "callback id reused while still outstanding"
            );
        }
        PendingCall {
            handle,
            registry: Some(Arc::clone(self)),
        }
    }

    /// Number of callbacks still waiting for completion.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, handle: CallbackHandle) -> bool {
        lock(&self.pending).contains_key(&handle.id())
    }

    /// Drop every outstanding id older than `ttl`. Returns the expired ids.
    pub fn expire_stale(&self, ttl: Duration) -> Vec<i64> {
        let now = Instant::now();
        let mut pending = lock(&self.pending);
        let expired: Vec<i64> = pending
            .iter()
            .filter(|(_, accepted)| now.duration_since(**accepted) > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            pending.remove(id);
        }
        if !expired.is_empty() {
            tracing::warn!(
                resolver = %self.resolver,
                expired = ?expired,
                "expired callback handles that never completed"
            );
        }
        expired
    }

    /// Periodically expire stale handles until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, runtime: &tokio::runtime::Handle, ttl: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = (ttl / 4).max(Duration::from_secs(1));
        runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.expire_stale(ttl);
            }
        });
    }

    fn complete(&self, id: i64) -> bool {
        lock(&self.pending).remove(&id).is_some()
    }
}

/// A continuation that must be invoked at most once.
///
/// Consumed by [`invoke`](Self::invoke). Dropping it unused releases the id.
#[derive(Debug)]
pub struct PendingCall {
    handle: CallbackHandle,
    registry: Option<Arc<CallbackRegistry>>,
}

impl PendingCall {
    pub fn handle(&self) -> CallbackHandle {
        self.handle
    }

    /// Deliver `reply` to the script continuation on its script thread.
    ///
    /// Returns `false` if the handle had expired or the script thread is gone.
    pub fn invoke(mut self, outcome: CallbackOutcome, reply: HttpReply) -> bool {
        let Some(registry) = self.registry.take() else {
            return false;
        };
        let id = self.handle.id();

        if !registry.complete(id) {
            tracing::warn!(
                resolver = %registry.resolver,
                callback_id = id,
                "discarding completion for expired callback handle"
            );
            return false;
        }

        let invocation = CallbackInvocation { id, outcome, reply };
        match registry.script.send(EngineMessage::Callback(invocation)) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    resolver = %registry.resolver,
                    callback_id = id,
                    "failed to marshal callback onto script thread: {e}"
                );
                false
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.complete(self.handle.id());
        }
    }
}

// ─── Native → script calls ──────────────────────────────────────────────

/// Outstanding native calls into script functions, answered through the
/// `callbackToNative` bridge method.
#[derive(Debug, Default)]
pub struct NativeCallTable {
    next_id: AtomicI64,
    waiting: Mutex<HashMap<i64, oneshot::Sender<Option<String>>>>,
}

impl NativeCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id and the receiver its answer will arrive on.
    pub fn register(&self) -> (i64, oneshot::Receiver<Option<String>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.waiting).insert(id, tx);
        (id, rx)
    }

    /// Resolve call `id`. Returns `false` for unknown or abandoned ids.
    pub fn resolve(&self, id: i64, payload: Option<String>) -> bool {
        let Some(tx) = lock(&self.waiting).remove(&id) else {
            return false;
        };
        tx.send(payload).is_ok()
    }

    /// Forget call `id` (used when the waiter times out).
    pub fn cancel(&self, id: i64) {
        lock(&self.waiting).remove(&id);
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.waiting).len()
    }
}
