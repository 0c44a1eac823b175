//! Waiting for a login that may never come.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::errors::InvocationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    LoggedIn,
    /// The login token expired first.
    Expired,
}

/// Resolves on whichever comes first: login, token expiry, or the caller
/// giving up.
///
/// Obtained from [`crate::Engine::login_wait`]; typically used while a QR
/// login token is shown to the user.
#[derive(Clone, Debug)]
pub struct LoginWait {
    logged_in: CancellationToken,
}

impl LoginWait {
    pub(crate) fn new(logged_in: CancellationToken) -> Self {
        Self { logged_in }
    }

    /// Wait until login, `expires_at`, or `cancel`.
    ///
    /// A cancelled `cancel` token wins over everything else and is reported
    /// as [`InvocationError::Cancelled`].
    pub async fn wait(
        &self,
        expires_at: Option<DateTime<Utc>>,
        cancel:     Option<CancellationToken>,
    ) -> Result<LoginOutcome, InvocationError> {
        let cancel = cancel.unwrap_or_default();
        let expiry = async {
            match expires_at {
                Some(at) => {
                    let left = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(left).await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("[auth] login wait cancelled");
                Err(InvocationError::Cancelled)
            }
            _ = self.logged_in.cancelled() => Ok(LoginOutcome::LoggedIn),
            _ = expiry => {
                tracing::debug!("[auth] login token expired");
                Ok(LoginOutcome::Expired)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires() {
        let w = LoginWait::new(CancellationToken::new());
        let at = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(w.wait(Some(at), None).await.unwrap(), LoginOutcome::Expired);
    }

    #[tokio::test]
    async fn login_fires() {
        let token = CancellationToken::new();
        let w = LoginWait::new(token.clone());
        token.cancel();
        assert_eq!(w.wait(None, None).await.unwrap(), LoginOutcome::LoggedIn);
    }

    #[tokio::test]
    async fn cancellation_beats_expiry() {
        let w = LoginWait::new(CancellationToken::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let past = Utc::now() - chrono::Duration::seconds(5);
        assert!(matches!(w.wait(Some(past), Some(cancel)).await, Err(InvocationError::Cancelled)));
    }
}
