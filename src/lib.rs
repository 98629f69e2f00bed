//! vmsmith: Linux guest VMs on the host's native virtualization capability.
//!
//! The library is the VM lifecycle orchestrator; `main.rs` is a thin CLI over
//! it. See [`vm::VmHandle`] for the entry point.

pub mod config;
pub mod error;
pub mod hypervisor;
pub mod logging;
pub mod paths;
pub mod vm;

pub use error::{Result, VmError};
