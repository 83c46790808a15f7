// # Device Manager Implementations
//
// Implementations of the DeviceManager trait that ship with the agent.

pub mod memory;

pub use memory::{MemoryDeviceManager, ProvisioningFile};
