// # lora-core
//
// Core library of the LoRaWAN uplink ingestion agent.
//
// ## Architecture Overview
//
// The agent connects to LoRaWAN application servers over a publish/subscribe
// broker, receives device uplinks and turns them into attribute updates:
//
// - **ProviderAdapter**: topic grammar and body shapes of one provider family
//   (The Things Network, ChirpStack, LoRaServer.io)
// - **BrokerBinding**: one broker session with a replayed subscription set and
//   bounded linear reconnects
// - **IngestionPipeline**: parse, resolve, decode and emit for every message
// - **codec**: CayenneLPP, CBOR and pass-through payload decoding
// - **DeviceTable**: per-application devices, by id or EUI
// - **ApplicationRegistry**: lifecycle of every live application
//
// Data flows one way (transport → binding → pipeline → sink); provisioning
// flows the other way through the registry.
//
// ## Design Principles
//
// 1. **Collaborators behind traits**: transport, device manager and update
//    sink are injected, so the core runs against test doubles
// 2. **Nothing escapes the message path**: parse and decode failures are
//    logged and the message is dropped
// 3. **Per-application isolation**: every application owns its tables,
//    tasks and cancellation token

pub mod adapters;
pub mod application;
pub mod binding;
pub mod codec;
pub mod config;
pub mod device_table;
pub mod directory;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod sink;
pub mod traits;

// Re-export core types for convenience
pub use adapters::{ProviderAdapter, adapter_for};
pub use application::{Application, ApplicationConfig};
pub use binding::{BrokerBinding, ConnectionState, StopReason};
pub use config::{AgentConfig, BindingConfig, LorawanConfig, PipelineConfig, ProviderKind};
pub use device_table::{AddOutcome, DeviceTable};
pub use directory::MemoryDeviceManager;
pub use error::{DecodeError, Error, Result};
pub use model::{DataModel, DecodedAttribute, Device, GroupConfig, TenantConfig, UplinkEvent};
pub use pipeline::IngestionPipeline;
pub use registry::ApplicationRegistry;
pub use sink::LogUpdateSink;
pub use traits::{DeviceManager, MessageHandler, Transport, UpdateSink};
