//! Retry policies for handling `FLOOD_WAIT` and transient I/O errors.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::InvocationError;

/// Controls how the dispatcher reacts when an RPC call fails.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    pub fail_count:       NonZeroU32,
    pub slept_so_far:     Duration,
    /// Per-call flood-wait ceiling. Overrides the policy's own threshold.
    pub flood_wait_limit: Option<Duration>,
    pub error:            InvocationError,
}

/// Never retry.
pub struct NoRetries;
impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Sleep on FLOOD_WAIT while it stays under the ceiling, retry once on I/O errors.
pub struct AutoSleep {
    pub threshold:             Duration,
    pub io_errors_as_flood_of: Option<Duration>,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self {
            threshold:             Duration::from_secs(60),
            io_errors_as_flood_of: Some(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if let Some(secs) = ctx.error.flood_wait_seconds() {
            let limit = ctx.flood_wait_limit.unwrap_or(self.threshold);
            if secs <= limit.as_secs() {
                tracing::info!("[dispatch] FLOOD_WAIT_{secs}, sleeping before retry");
                return ControlFlow::Continue(Duration::from_secs(secs));
            }
            tracing::warn!("[dispatch] FLOOD_WAIT_{secs} exceeds the {}s ceiling", limit.as_secs());
            return ControlFlow::Break(());
        }
        if matches!(ctx.error, InvocationError::Io(_)) && ctx.fail_count.get() == 1 {
            if let Some(d) = self.io_errors_as_flood_of {
                tracing::info!("[dispatch] I/O error, sleeping {:?} before retry", d);
                return ControlFlow::Continue(d);
            }
        }
        ControlFlow::Break(())
    }
}
