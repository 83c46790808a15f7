// # Update Sink Implementations

pub mod log;

pub use log::LogUpdateSink;
