//! Broker binding
//!
//! A `BrokerBinding` owns one broker session for one application, the set
//! of topics the application wants, and the reconnect state machine.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──Connected──▶ Connected
//!                             │                        │
//!                        connect error            session lost
//!                             ▼                        ▼
//!                  ┌──── Reconnecting{n} ◀─────────────┘
//!                  │          │
//!            n > max          └──(n × delay)──▶ Connecting
//!                  ▼
//!      Stopped(RetriesExhausted)          stop() ──▶ Stopped(Requested)
//! ```
//!
//! ## Subscriptions
//!
//! The desired-topic set is updated before any transport call, so it is
//! correct while disconnected. Every time the broker accepts a session
//! the whole set is replayed, because subscriptions are not assumed to
//! survive a reconnect. The set and the live session handle sit behind one
//! async mutex; replay runs while holding it, so a concurrent `subscribe`
//! lands either in the replay or as a direct call, never both.
//!
//! ## Cancellation
//!
//! `stop()` cancels the binding's token before the session is closed, so
//! the worker treats the close as requested and never schedules a
//! reconnect. Backoff sleeps race the token.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BindingConfig;
use crate::error::Result;
use crate::traits::{
    ConnectOptions, MessageHandler, Transport, TransportConnection, TransportEvent,
    TransportHandle,
};

/// Why a binding stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// The reconnect budget was exhausted
    RetriesExhausted,
}

/// Connection state of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: usize },
    Stopped(StopReason),
}

impl ConnectionState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

#[derive(Default)]
struct Subscriptions {
    desired: BTreeSet<String>,
    /// Present only while the broker has accepted the session
    handle: Option<Arc<dyn TransportHandle>>,
}

struct BindingShared {
    label: String,
    options: ConnectOptions,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    config: BindingConfig,
    subscriptions: Mutex<Subscriptions>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

enum SessionEnd {
    Cancelled,
    Lost { was_connected: bool, reason: String },
}

/// One broker session with subscription tracking and reconnects
pub struct BrokerBinding {
    shared: Arc<BindingShared>,
    worker: SyncMutex<Option<JoinHandle<()>>>,
}

impl BrokerBinding {
    /// Create a binding; nothing connects until [`BrokerBinding::start`]
    ///
    /// # Parameters
    ///
    /// - `label`: identifies the binding in logs (the application id)
    /// - `cancel`: stopping token, usually a child of the application's
    pub fn new(
        label: impl Into<String>,
        options: ConnectOptions,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        config: BindingConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(BindingShared {
                label: label.into(),
                options,
                transport,
                handler,
                config,
                subscriptions: Mutex::new(Subscriptions::default()),
                state,
                cancel,
            }),
            worker: SyncMutex::new(None),
        }
    }

    /// Spawn the connection worker; later calls are no-ops
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.shared.cancel.is_cancelled() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *worker = Some(tokio::spawn(async move { shared.run().await }));
    }

    /// Stop the binding and wait for its worker to finish
    ///
    /// Idempotent. No reconnect is attempted after this returns.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(application_id = %self.shared.label, error = %e, "binding worker panicked");
            }
        }

        let mut subscriptions = self.shared.subscriptions.lock().await;
        if let Some(handle) = subscriptions.handle.take() {
            if let Err(e) = handle.disconnect().await {
                debug!(application_id = %self.shared.label, error = %e, "disconnect after stop failed");
            }
        }
        drop(subscriptions);

        self.shared.state.send_if_modified(|state| {
            if state.is_stopped() {
                false
            } else {
                *state = ConnectionState::Stopped(StopReason::Requested);
                true
            }
        });
    }

    /// Add a topic to the desired set and subscribe if connected
    ///
    /// Subscribing to a topic that is already desired does nothing. A
    /// transport failure is returned but the topic stays desired and is
    /// replayed on the next session.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if !subscriptions.desired.insert(topic.to_string()) {
            debug!(application_id = %self.shared.label, topic, "topic already subscribed");
            return Ok(());
        }

        match &subscriptions.handle {
            Some(handle) => {
                handle.subscribe(topic).await?;
                info!(application_id = %self.shared.label, topic, "subscribed");
            }
            None => {
                debug!(application_id = %self.shared.label, topic, "not connected, subscription deferred");
            }
        }
        Ok(())
    }

    /// Remove a topic from the desired set and unsubscribe if connected
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if !subscriptions.desired.remove(topic) {
            return Ok(());
        }

        if let Some(handle) = &subscriptions.handle {
            handle.unsubscribe(topic).await?;
            info!(application_id = %self.shared.label, topic, "unsubscribed");
        }
        Ok(())
    }

    /// Whether `topic` is in the desired set
    pub async fn is_desired(&self, topic: &str) -> bool {
        self.shared.subscriptions.lock().await.desired.contains(topic)
    }

    /// Snapshot of the desired set, sorted
    pub async fn desired_topics(&self) -> Vec<String> {
        self.shared
            .subscriptions
            .lock()
            .await
            .desired
            .iter()
            .cloned()
            .collect()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl BindingShared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run(&self) {
        let mut attempt = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.connect(&self.options) => result,
            };

            match connected {
                Ok(connection) => match self.drive(connection).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost {
                        was_connected,
                        reason,
                    } => {
                        if was_connected {
                            attempt = 0;
                        }
                        warn!(
                            application_id = %self.label,
                            host = %self.options.host,
                            reason = %reason,
                            "broker session lost"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        application_id = %self.label,
                        host = %self.options.host,
                        error = %e,
                        "broker connection failed"
                    );
                }
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                error!(
                    application_id = %self.label,
                    host = %self.options.host,
                    max_attempts = self.config.max_reconnect_attempts,
                    "reconnect attempts exhausted, stopping application"
                );
                self.set_state(ConnectionState::Stopped(StopReason::RetriesExhausted));
                return;
            }

            let delay = self.config.reconnect_delay(attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            warn!(
                application_id = %self.label,
                attempt,
                max_attempts = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to broker"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Stopped(StopReason::Requested));
        debug!(application_id = %self.label, "binding worker stopped");
    }

    /// Pump one session's events until it ends
    async fn drive(&self, connection: TransportConnection) -> SessionEnd {
        let TransportConnection { handle, mut events } = connection;
        let mut was_connected = false;

        let reason = loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.detach().await;
                    if let Err(e) = handle.disconnect().await {
                        debug!(application_id = %self.label, error = %e, "disconnect failed");
                    }
                    return SessionEnd::Cancelled;
                }
                event = events.next() => event,
            };

            match event {
                Some(TransportEvent::Connected) => {
                    self.attach(Arc::clone(&handle)).await;
                    was_connected = true;
                    self.set_state(ConnectionState::Connected);
                }
                Some(TransportEvent::Message { topic, payload }) => {
                    self.handler.handle_message(&topic, &payload);
                }
                Some(TransportEvent::Disconnected(reason)) => break reason,
                None => break "event stream closed".to_string(),
            }
        };

        self.detach().await;
        SessionEnd::Lost {
            was_connected,
            reason,
        }
    }

    /// Publish the session handle and replay every desired topic
    async fn attach(&self, handle: Arc<dyn TransportHandle>) {
        let mut subscriptions = self.subscriptions.lock().await;
        for topic in &subscriptions.desired {
            if let Err(e) = handle.subscribe(topic).await {
                warn!(application_id = %self.label, topic = %topic, error = %e, "resubscribe failed");
            }
        }
        info!(
            application_id = %self.label,
            host = %self.options.host,
            topics = subscriptions.desired.len(),
            "connected to broker"
        );
        subscriptions.handle = Some(handle);
    }

    async fn detach(&self) {
        self.subscriptions.lock().await.handle = None;
    }
}
