pub mod error;
pub mod hvnc;
pub mod task;
pub mod wire;

pub use error::ControlError;
pub use hvnc::{HvncSession, HvncSettings, HvncStatus};
pub use task::{QueueInfo, Task, TaskState};
pub use wire::{Inbound, PeerRole, TaskResult, WireMessage, MAX_ENVELOPE_BYTES};
