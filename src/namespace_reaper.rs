//! Discovery and termination of processes left inside a host's network namespace.

pub mod process_reaper;

pub use process_reaper::{NamespaceProcessReaper, NixSignaller, Signaller};
