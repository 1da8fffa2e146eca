// Library interface for contentblast modules
// This allows tests and other binaries to import modules

pub mod entitlement;
pub mod error;
pub mod formats;
pub mod llm;
pub mod payments;
pub mod repurpose;
pub mod server;
