pub mod controller_handler;
pub mod lab_lock;
pub mod lab_state;

pub use controller_handler::LabController;
pub use lab_lock::{LabLock, LockInfo};
pub use lab_state::LabState;
