//! Collaborator seams of the ingestion agent
//!
//! - [`Transport`]: publish/subscribe broker connections
//! - [`MessageHandler`]: receiver of inbound broker messages
//! - [`DeviceManager`]: external device/configuration registry
//! - [`UpdateSink`]: outbound attribute updates to the data platform

pub mod device_manager;
pub mod transport;
pub mod update_sink;

pub use device_manager::DeviceManager;
pub use transport::{
    ConnectOptions, MessageHandler, Transport, TransportConnection, TransportEvent,
    TransportHandle,
};
pub use update_sink::UpdateSink;
