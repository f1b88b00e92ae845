//! Mock Shot Devices
//!
//! This crate provides simulated device workers for exercising the shot queue
//! without hardware. All delays use `tokio::time::sleep`, so tests can run on a
//! paused clock.
//!
//! # Available Mock Workers
//!
//! - [`MockDevice`] - buffered output device (kind `mock_device`)
//! - [`MockPseudoclock`] - master pseudoclock with start trigger and completion
//!   wait (kind `mock_pseudoclock`)
//!
//! Every operation can be scripted with a [`MockBehavior`] and is recorded in a
//! shared [`CallLog`], which tests use to assert on ordering and overlap.
//!
//! # Worker Factory Pattern
//!
//! ```rust,ignore
//! use shot_driver_mock::{CallLog, MockDeviceFactory, MockPseudoclockFactory};
//! use shot_hardware::WorkerRegistry;
//!
//! let log = CallLog::new();
//! let mut registry = WorkerRegistry::new();
//! registry.register_factory(Box::new(MockPseudoclockFactory::with_log(log.clone())));
//! registry.register_factory(Box::new(MockDeviceFactory::with_log(log.clone())));
//! ```

pub mod common;
mod mock_device;
mod mock_pseudoclock;

pub use common::{CallKind, CallLog, CallRecord, MockBehavior, MockMode, MockRng};
pub use mock_device::{MockDevice, MockDeviceConfig, MockDeviceFactory};
pub use mock_pseudoclock::{MockPseudoclock, MockPseudoclockConfig, MockPseudoclockFactory};
