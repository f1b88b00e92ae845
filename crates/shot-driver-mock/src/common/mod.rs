//! Shared utilities for mock workers.

mod behavior;
mod call_log;
mod mode;
mod rng;

pub use behavior::MockBehavior;
pub use call_log::{CallKind, CallLog, CallRecord};
pub(crate) use call_log::CallGuard;
pub use mode::MockMode;
pub use rng::MockRng;
