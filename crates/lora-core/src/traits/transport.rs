// # Transport Trait
//
// Defines the publish/subscribe primitive a broker binding drives.
//
// ## Contract
//
// - `connect` starts one broker session and returns immediately with a
//   handle and an event stream
// - The stream yields `Connected` once the broker accepted the session,
//   `Message` for every inbound publish, and a single `Disconnected` when
//   the session is lost. The stream ends after `Disconnected`.
// - Sessions never reconnect on their own; the binding opens a new one.
// - Subscriptions are not assumed to survive a new session.
//
// Publishing is not part of the contract: the agent is uplink-only.

use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;

use crate::error::Result;

/// Parameters for one broker session
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// `mqtt`, `mqtts`, `tcp`, `ssl`, ...
    pub scheme: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Events produced by a broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session accepted by the broker
    Connected,
    /// Inbound publish
    Message { topic: String, payload: Vec<u8> },
    /// Session lost; carries the reason
    Disconnected(String),
}

/// Control half of a broker session
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Close the session; no reconnect follows
    async fn disconnect(&self) -> Result<()>;
}

/// An opened broker session
pub struct TransportConnection {
    pub handle: Arc<dyn TransportHandle>,
    pub events: Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>>,
}

/// Factory of broker sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new session
    ///
    /// # Returns
    ///
    /// - `Ok(TransportConnection)`: session started, watch `events` for the outcome
    /// - `Err(Error)`: the session could not be started (bad scheme, DNS, ...)
    async fn connect(&self, options: &ConnectOptions) -> Result<TransportConnection>;
}

/// Receiver of inbound broker messages
///
/// Called inline from the binding's event loop, so implementations must
/// return without waiting on I/O.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, topic: &str, payload: &[u8]);
}
