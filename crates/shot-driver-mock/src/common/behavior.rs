//! Scripted behaviour for mock device operations.
//!
//! Each worker operation (transition, teardown, start, wait) follows one
//! [`MockBehavior`]. Tests script failures and hangs per device:
//!
//! ```rust,ignore
//! let dds = MockDevice::new("dds41", log.clone())
//!     .with_transition(MockBehavior::Hang);
//! ```

use std::time::Duration;

/// How a mock operation completes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MockBehavior {
    /// Complete immediately with success
    #[default]
    Succeed,
    /// Complete after a delay with success
    Delay(Duration),
    /// Complete immediately with an error
    Fail(String),
    /// Complete after a delay with an error
    FailAfter(Duration, String),
    /// Never complete
    Hang,
}

impl MockBehavior {
    /// Success after `ms` milliseconds.
    pub fn delay_ms(ms: u64) -> Self {
        MockBehavior::Delay(Duration::from_millis(ms))
    }

    /// Immediate failure with a message.
    pub fn fail(message: impl Into<String>) -> Self {
        MockBehavior::Fail(message.into())
    }

    /// Failure with a message after `ms` milliseconds.
    pub fn fail_after_ms(ms: u64, message: impl Into<String>) -> Self {
        MockBehavior::FailAfter(Duration::from_millis(ms), message.into())
    }

    /// Run the scripted behaviour, adding `extra` to any delay.
    pub(crate) async fn run(&self, extra: Duration) -> anyhow::Result<()> {
        match self {
            MockBehavior::Succeed => {
                if !extra.is_zero() {
                    tokio::time::sleep(extra).await;
                }
                Ok(())
            }
            MockBehavior::Delay(d) => {
                tokio::time::sleep(*d + extra).await;
                Ok(())
            }
            MockBehavior::Fail(msg) => Err(anyhow::anyhow!("{}", msg)),
            MockBehavior::FailAfter(d, msg) => {
                tokio::time::sleep(*d + extra).await;
                Err(anyhow::anyhow!("{}", msg))
            }
            MockBehavior::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
