//! Script thread: serializes all script execution for one resolver.
//!
//! The script engine is not safe to enter from several threads, so every
//! resolver gets one dedicated OS thread that owns its engine. Everything
//! that wants to run script code (host calls, completed async requests)
//! sends an [`EngineMessage`] to that thread through a [`ScriptThreadHandle`].

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use crate::callbacks::CallbackInvocation;
use crate::error::BridgeError;
use crate::gateway::Gateway;

/// A script runtime that can execute resolver code.
///
/// Implementations call back into the bridge through the `gateway` they
/// are handed; those calls run synchronously on the script thread.
pub trait ScriptEngine: Send {
    /// Run the exported script function `function` with a JSON `input`.
    fn call_function(
        &mut self,
        function: &str,
        input: &str,
        gateway: &Gateway,
    ) -> Result<(), BridgeError>;

    /// Hand a completed async call to its script continuation.
    fn deliver_callback(
        &mut self,
        invocation: &CallbackInvocation,
        gateway: &Gateway,
    ) -> Result<(), BridgeError>;
}

/// Work item for a script thread.
#[derive(Debug)]
pub enum EngineMessage {
    Call {
        function: String,
        input: String,
        done: Option<oneshot::Sender<Result<(), BridgeError>>>,
    },
    Callback(CallbackInvocation),
    Shutdown,
}

/// Cloneable sender side of a script thread.
#[derive(Debug, Clone)]
pub struct ScriptThreadHandle {
    resolver: Arc<str>,
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl ScriptThreadHandle {
    /// Create a handle and the receiver a [`ScriptThread`] will drain.
    pub fn channel(resolver: &str) -> (Self, mpsc::UnboundedReceiver<EngineMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                resolver: Arc::from(resolver),
                tx,
            },
            rx,
        )
    }

    pub fn resolver(&self) -> &str {
        &self.resolver
    }

    pub fn send(&self, message: EngineMessage) -> Result<(), BridgeError> {
        self.tx.send(message).map_err(|_| {
            BridgeError::Engine(format!(
                "script thread for resolver '{}' is not running",
                self.resolver
            ))
        })
    }

    /// Queue a script function call; the receiver resolves once it ran.
    pub fn call(
        &self,
        function: &str,
        input: String,
    ) -> Result<oneshot::Receiver<Result<(), BridgeError>>, BridgeError> {
        let (done, rx) = oneshot::channel();
        self.send(EngineMessage::Call {
            function: function.to_string(),
            input,
            done: Some(done),
        })?;
        Ok(rx)
    }

    /// Queue a script function call without waiting for it.
    pub fn post(&self, function: &str, input: String) -> Result<(), BridgeError> {
        self.send(EngineMessage::Call {
            function: function.to_string(),
            input,
            done: None,
        })
    }

    /// Ask the thread to stop after the messages already queued.
    pub fn shutdown(&self) -> Result<(), BridgeError> {
        self.send(EngineMessage::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A running script thread.
#[derive(Debug)]
pub struct ScriptThread {
    join: JoinHandle<()>,
}

impl ScriptThread {
    /// Start the thread that owns `engine` and drains `rx` in order.
    pub fn spawn(
        resolver: &str,
        mut rx: mpsc::UnboundedReceiver<EngineMessage>,
        mut engine: Box<dyn ScriptEngine>,
        gateway: Arc<Gateway>,
    ) -> Result<Self, BridgeError> {
        let resolver = resolver.to_string();
        let join = std::thread::Builder::new()
            .name(format!("script-{resolver}"))
            .spawn(move || {
                tracing::debug!(resolver = %resolver, "script thread started");
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        EngineMessage::Call {
                            function,
                            input,
                            done,
                        } => {
                            let result = engine.call_function(&function, &input, &gateway);
                            if let Err(e) = &result {
                                tracing::error!(
                                    resolver = %resolver,
                                    function = %function,
                                    "script function failed: {e}"
                                );
                            }
                            if let Some(done) = done {
                                let _ = done.send(result);
                            }
                        }
                        EngineMessage::Callback(invocation) => {
                            if let Err(e) = engine.deliver_callback(&invocation, &gateway) {
                                tracing::error!(
                                    resolver = %resolver,
                                    callback_id = invocation.id,
                                    "callback delivery failed: {e}"
                                );
                            }
                        }
                        EngineMessage::Shutdown => break,
                    }
                }
                tracing::debug!(resolver = %resolver, "script thread stopped");
            })?;
        Ok(Self { join })
    }

    /// Wait for the thread to exit (after [`ScriptThreadHandle::shutdown`]).
    pub fn join(self) -> Result<(), BridgeError> {
        self.join
            .join()
            .map_err(|_| BridgeError::Engine("script thread panicked".into()))
    }
}
