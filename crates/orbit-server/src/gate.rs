//! Connection gate.
//!
//! Every upgraded socket passes through the gate before it may send protocol
//! events. The token is validated on its own task so a peer that goes away
//! mid-validation never cancels the validator; its verdict is just dropped.

use orbit_core::{AuthError, TokenValidator};
use orbit_protocol::Identity;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of the handshake.
#[derive(Debug)]
pub enum GateOutcome {
    /// The token is valid; the connection may proceed as this identity.
    Admitted(Identity),
    /// The connection must be closed without a reason.
    Rejected(AuthError),
    /// The peer closed before validation finished.
    Abandoned,
}

/// Authenticates new connections.
#[derive(Clone)]
pub struct ConnectionGate {
    validator: Arc<dyn TokenValidator>,
    timeout: Duration,
}

impl ConnectionGate {
    /// Create a gate bounding validation by `timeout`.
    #[must_use]
    pub fn new(validator: Arc<dyn TokenValidator>, timeout: Duration) -> Self {
        Self { validator, timeout }
    }

    /// Validate `token`, racing the validation against `closed`.
    ///
    /// `closed` resolves when the peer goes away. An empty token counts as
    /// missing.
    pub async fn admit<F>(&self, token: Option<&str>, closed: F) -> GateOutcome
    where
        F: Future<Output = ()>,
    {
        let Some(token) = token.filter(|token| !token.is_empty()) else {
            return GateOutcome::Rejected(AuthError::MissingToken);
        };

        let validator = Arc::clone(&self.validator);
        let token = token.to_string();
        let timeout = self.timeout;
        let validation = tokio::spawn(async move {
            match tokio::time::timeout(timeout, validator.decode(&token)).await {
                Ok(result) => result,
                Err(_) => Err(AuthError::Timeout),
            }
        });

        tokio::select! {
            joined = validation => match joined {
                Ok(Ok(identity)) => GateOutcome::Admitted(identity),
                Ok(Err(e)) => GateOutcome::Rejected(e),
                Err(e) => GateOutcome::Rejected(AuthError::Validator(e.to_string())),
            },
            () = closed => {
                debug!("Peer closed during token validation");
                GateOutcome::Abandoned
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts `ok:<uid>` after `delay`, refuses anything else.
    struct SlowValidator {
        delay: Duration,
        finished: AtomicUsize,
    }

    impl SlowValidator {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                finished: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TokenValidator for SlowValidator {
        async fn decode(&self, token: &str) -> Result<Identity, AuthError> {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            match token.strip_prefix("ok:") {
                Some(uid) => Ok(Identity::new(uid, uid, format!("{uid}@example.com"))),
                None => Err(AuthError::Malformed("bad token".into())),
            }
        }
    }

    fn gate(validator: Arc<SlowValidator>) -> ConnectionGate {
        ConnectionGate::new(validator, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_missing_token() {
        let validator = SlowValidator::new(Duration::ZERO);
        let gate = gate(validator.clone());

        for token in [None, Some("")] {
            let outcome = gate.admit(token, std::future::pending()).await;
            assert!(matches!(outcome, GateOutcome::Rejected(AuthError::MissingToken)));
        }
        assert_eq!(validator.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_admit_and_reject() {
        let gate = gate(SlowValidator::new(Duration::from_millis(1)));

        match gate.admit(Some("ok:u1"), std::future::pending()).await {
            GateOutcome::Admitted(identity) => assert_eq!(identity.uid, "u1"),
            other => panic!("expected admission, got {other:?}"),
        }
        assert!(matches!(
            gate.admit(Some("forged"), std::future::pending()).await,
            GateOutcome::Rejected(AuthError::Malformed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_rejection() {
        let gate = gate(SlowValidator::new(Duration::from_secs(60)));

        let outcome = gate.admit(Some("ok:u1"), std::future::pending()).await;
        assert!(matches!(outcome, GateOutcome::Rejected(AuthError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_validation_still_completes() {
        let validator = SlowValidator::new(Duration::from_secs(1));
        let gate = gate(validator.clone());

        let outcome = gate
            .admit(Some("ok:u1"), tokio::time::sleep(Duration::from_millis(10)))
            .await;
        assert!(matches!(outcome, GateOutcome::Abandoned));
        assert_eq!(validator.finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(validator.finished.load(Ordering::SeqCst), 1);
    }
}
