//! Interactive control of a running lab.

pub mod console_session;

pub use console_session::{ConsoleSession, InteractiveSession};
