//! Delivery engine - drives one message through the web session.
//!
//! Stateless between calls; all session state lives in the
//! `SessionManager`. Transient driver errors are retried under a bounded
//! policy, auth failures propagate immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use donatrack_bridge::whatsapp;
use donatrack_bridge::{BridgeError, RetryPolicy};

use crate::session::{SessionManager, AUTH_PROBE_TIMEOUT};

/// Wait for the recipient-scoped composer to render.
const COMPOSER_TIMEOUT: Duration = Duration::from_secs(30);

/// The composer accepts keystrokes before the page has finished hydrating;
/// pressing enter too early silently drops the message.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Confirmation that the outbound request actually left the page.
const SEND_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can push one message to one recipient. The dispatch queue
/// is written against this seam.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, phone: &str, body: &str) -> Result<(), BridgeError>;
}

pub struct DeliveryEngine {
    session: Arc<SessionManager>,
    retry: RetryPolicy,
}

impl DeliveryEngine {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self::with_policy(session, RetryPolicy::default())
    }

    pub fn with_policy(session: Arc<SessionManager>, retry: RetryPolicy) -> Self {
        Self { session, retry }
    }

    async fn try_deliver(&self, phone: &str, body: &str) -> Result<(), BridgeError> {
        let mut guard = self.session.acquire().await?;

        if !guard.probe_authenticated(AUTH_PROBE_TIMEOUT).await {
            return Err(BridgeError::NotAuthenticated);
        }

        let driver = guard.driver();
        driver.navigate(&whatsapp::send_url(phone, body)).await?;
        driver
            .wait_for_selector(whatsapp::COMPOSER_SELECTOR, COMPOSER_TIMEOUT)
            .await?;

        tokio::time::sleep(SETTLE_DELAY).await;

        let driver = guard.driver();
        driver.click(whatsapp::COMPOSER_SELECTOR).await?;
        driver.press_enter().await?;
        driver.wait_for_network_idle(SEND_IDLE_TIMEOUT).await?;

        Ok(())
    }
}

#[async_trait]
impl Deliverer for DeliveryEngine {
    async fn deliver(&self, phone: &str, body: &str) -> Result<(), BridgeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_deliver(phone, body).await {
                Ok(()) => {
                    info!(
                        component = "delivery",
                        event = "delivery.sent",
                        recipient = %phone,
                        attempt = attempt,
                        "Message delivered"
                    );
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        component = "delivery",
                        event = "delivery.attempt_failed",
                        recipient = %phone,
                        attempt = attempt,
                        error = %e,
                        "Delivery attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(e) => {
                    warn!(
                        component = "delivery",
                        event = "delivery.failed",
                        recipient = %phone,
                        attempt = attempt,
                        error = %e,
                        "Delivery failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeBackend;
    use std::sync::atomic::Ordering;

    fn engine_with_fast_retries(session: Arc<SessionManager>) -> DeliveryEngine {
        DeliveryEngine::with_policy(session, RetryPolicy::immediate(3))
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_through_recipient_url() {
        let (backend, state) = FakeBackend::new();
        state.authenticated.store(true, Ordering::SeqCst);
        let session = Arc::new(SessionManager::new(Box::new(backend)));
        let engine = engine_with_fast_retries(session);

        engine.deliver("911234567890", "thank you").await.unwrap();

        let navs = state.navigations.lock().unwrap();
        assert!(navs
            .iter()
            .any(|url| url.contains("/send?phone=911234567890")));
        assert_eq!(state.enters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthenticated_session_fails_without_retry() {
        let (backend, state) = FakeBackend::new();
        let session = Arc::new(SessionManager::new(Box::new(backend)));
        let engine = engine_with_fast_retries(session);

        let err = engine.deliver("911234", "hi").await.err().unwrap();
        assert!(matches!(err, BridgeError::NotAuthenticated));
        // Only the bring-up navigation happened
        assert_eq!(state.navigations.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let (backend, state) = FakeBackend::new();
        state.authenticated.store(true, Ordering::SeqCst);
        state
            .nav_errors
            .lock()
            .unwrap()
            .push_back("connection reset".into());
        let session = Arc::new(SessionManager::new(Box::new(backend)));
        let engine = engine_with_fast_retries(session);

        engine.deliver("911234", "hi").await.unwrap();
        assert_eq!(state.enters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_failure() {
        let (backend, state) = FakeBackend::new();
        state.authenticated.store(true, Ordering::SeqCst);
        {
            let mut errs = state.nav_errors.lock().unwrap();
            for _ in 0..3 {
                errs.push_back("connection reset".into());
            }
        }
        let session = Arc::new(SessionManager::new(Box::new(backend)));
        let engine = engine_with_fast_retries(session);

        let err = engine.deliver("911234", "hi").await.err().unwrap();
        assert!(err.is_transient());
        assert_eq!(state.enters.load(Ordering::SeqCst), 0);
    }
}
