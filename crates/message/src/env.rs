//! Listener registry and local message routing.
//!
//! Responsibilities:
//! - register one listener per logical listener id within an environment;
//! - deliver fire-and-forget and request/reply messages in per-sender order;
//! - surface dropped replies as deadline-exceeded errors.
//!
//! The [`LocalMessageDispatcher`] routes between environments hosted in one
//! process, which is how the runtime is wired in tests and single-node
//! deployments. A remote transport only needs to provide the same
//! [`MessageSender`] semantics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use cascade_common::{CascadeError, Result};

use crate::control::Message;

/// Reserved listener id of the master-side runtime listener.
pub const RUNTIME_MASTER_LISTENER_ID: &str = "runtime-master";
/// Reserved listener id of the executor-side listener.
pub const EXECUTOR_LISTENER_ID: &str = "executor";

enum Envelope {
    OneWay {
        sender_id: String,
        message: Message,
    },
    Request {
        sender_id: String,
        message: Message,
        reply_tx: oneshot::Sender<Message>,
    },
}

/// Receives control messages addressed to one logical listener id.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Handles a fire-and-forget message.
    async fn on_message(&self, message: Message);

    /// Handles a request; `context.reply` completes the matching request
    /// future on the sender side.
    async fn on_message_with_context(&self, message: Message, context: MessageContext);
}

/// Reply handle for one in-flight request.
pub struct MessageContext {
    sender_id: String,
    request_id: u64,
    reply_tx: oneshot::Sender<Message>,
}

impl MessageContext {
    /// Id of the environment the request came from.
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Id of the request message; replies should echo it.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Sends the reply. A requester that already timed out is ignored.
    pub fn reply(self, message: Message) {
        if self.reply_tx.send(message).is_err() {
            debug!(
                sender_id = %self.sender_id,
                request_id = self.request_id,
                "reply dropped; requester no longer waiting"
            );
        }
    }
}

/// Routes envelopes between co-hosted environments, keyed by
/// `(environment id, listener id)`.
#[derive(Default)]
pub struct LocalMessageDispatcher {
    inboxes: Mutex<HashMap<(String, String), mpsc::UnboundedSender<Envelope>>>,
}

impl LocalMessageDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, env_id: &str, listener_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inboxes = self.inboxes.lock().expect("dispatcher lock poisoned");
        if inboxes
            .insert((env_id.to_string(), listener_id.to_string()), tx)
            .is_some()
        {
            warn!(
                env_id = %env_id,
                listener_id = %listener_id,
                "listener replaced an existing registration"
            );
        }
        rx
    }

    fn deregister(&self, env_id: &str, listener_id: &str) {
        let mut inboxes = self.inboxes.lock().expect("dispatcher lock poisoned");
        inboxes.remove(&(env_id.to_string(), listener_id.to_string()));
    }

    fn inbox(&self, env_id: &str, listener_id: &str) -> Option<mpsc::UnboundedSender<Envelope>> {
        let inboxes = self.inboxes.lock().expect("dispatcher lock poisoned");
        inboxes
            .get(&(env_id.to_string(), listener_id.to_string()))
            .cloned()
    }
}

/// One process's view of the control transport: a listener registry plus
/// sender construction toward other environments.
#[derive(Clone)]
pub struct MessageEnvironment {
    id: String,
    dispatcher: Arc<LocalMessageDispatcher>,
    request_timeout: Duration,
}

impl MessageEnvironment {
    /// Creates an environment named `id` attached to `dispatcher`.
    pub fn new(
        id: impl Into<String>,
        dispatcher: Arc<LocalMessageDispatcher>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            dispatcher,
            request_timeout,
        }
    }

    /// Id of this environment (the executor id, or the master id).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registers `listener` under `listener_id` and starts its delivery pump.
    ///
    /// Delivery is sequential per listener, which preserves per-sender order.
    pub fn setup_listener(&self, listener_id: &str, listener: Arc<dyn MessageListener>) {
        let mut rx = self.dispatcher.register(&self.id, listener_id);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::OneWay { message, .. } => listener.on_message(message).await,
                    Envelope::Request {
                        sender_id,
                        message,
                        reply_tx,
                    } => {
                        let context = MessageContext {
                            sender_id,
                            request_id: message.id,
                            reply_tx,
                        };
                        listener.on_message_with_context(message, context).await;
                    }
                }
            }
        });
    }

    /// Removes the listener registered under `listener_id`, stopping its pump.
    pub fn remove_listener(&self, listener_id: &str) {
        self.dispatcher.deregister(&self.id, listener_id);
    }

    /// Builds a sender toward `listener_id` in the environment `receiver_id`.
    pub fn get_sender(&self, receiver_id: &str, listener_id: &str) -> Result<MessageSender> {
        let target = self
            .dispatcher
            .inbox(receiver_id, listener_id)
            .ok_or_else(|| {
                CascadeError::Unknown(format!(
                    "no listener '{listener_id}' registered in environment '{receiver_id}'"
                ))
            })?;
        Ok(MessageSender {
            sender_id: self.id.clone(),
            receiver_label: format!("{receiver_id}/{listener_id}"),
            target,
            request_timeout: self.request_timeout,
        })
    }
}

/// Sends control messages toward one `(environment, listener)` pair.
#[derive(Clone)]
pub struct MessageSender {
    sender_id: String,
    receiver_label: String,
    target: mpsc::UnboundedSender<Envelope>,
    request_timeout: Duration,
}

impl MessageSender {
    /// Fire-and-forget send.
    pub fn send(&self, message: Message) -> Result<()> {
        self.target
            .send(Envelope::OneWay {
                sender_id: self.sender_id.clone(),
                message,
            })
            .map_err(|_| {
                CascadeError::Unknown(format!(
                    "control channel to {} is closed",
                    self.receiver_label
                ))
            })
    }

    /// Sends a request and awaits its reply under the environment's timeout.
    pub async fn request(&self, message: Message) -> Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.target
            .send(Envelope::Request {
                sender_id: self.sender_id.clone(),
                message,
                reply_tx,
            })
            .map_err(|_| {
                CascadeError::Unknown(format!(
                    "control channel to {} is closed",
                    self.receiver_label
                ))
            })?;
        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CascadeError::DeadlineExceeded(format!(
                "reply from {} was dropped",
                self.receiver_label
            ))),
            Err(_) => Err(CascadeError::DeadlineExceeded(format!(
                "no reply from {} within {:?}",
                self.receiver_label, self.request_timeout
            ))),
        }
    }
}
