//! Session handle - owns the single browser session and its generation.
//!
//! All drivers of the web session go through `acquire()`, which lazily
//! brings the session up and hands back an exclusive guard. `reset()`
//! tears the session down and bumps the generation counter; any operation
//! that captured an older generation aborts as a no-op when it checks in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use donatrack_bridge::whatsapp;
use donatrack_bridge::{BridgeError, RetryPolicy, SessionBackend, WebSession};
use donatrack_protocol::SessionStatusInfo;

/// How long the delivery path waits for the authenticated marker.
pub const AUTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shorter probe used by the periodic status refresh so a logged-out
/// session does not stall the tick.
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const INIT_ATTEMPTS: u32 = 3;

pub struct SessionManager {
    backend: Box<dyn SessionBackend>,
    driver: Mutex<Option<Box<dyn WebSession>>>,
    generation: AtomicU64,
    status: ArcSwap<SessionStatusInfo>,
}

impl SessionManager {
    pub fn new(backend: Box<dyn SessionBackend>) -> Self {
        Self {
            backend,
            driver: Mutex::new(None),
            generation: AtomicU64::new(0),
            status: ArcSwap::from_pointee(SessionStatusInfo::default()),
        }
    }

    /// Exclusive access to the live session, bringing one up if needed.
    ///
    /// Idempotent: a live session is handed back untouched. Bring-up makes
    /// up to three back-to-back attempts before giving up with
    /// `SessionInit`, which callers treat as fatal for dispatch.
    pub async fn acquire(&self) -> Result<SessionGuard<'_>, BridgeError> {
        let mut slot = self.driver.lock().await;

        if slot.is_none() {
            let driver = self.initialize().await.inspect_err(|_| {
                self.publish(false, false);
            })?;
            *slot = Some(driver);
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.publish(true, false);
        }

        Ok(SessionGuard {
            manager: self,
            generation: self.generation.load(Ordering::SeqCst),
            slot,
        })
    }

    async fn initialize(&self) -> Result<Box<dyn WebSession>, BridgeError> {
        let policy = RetryPolicy::immediate(INIT_ATTEMPTS);
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            match self.try_launch().await {
                Ok(driver) => {
                    info!(
                        component = "session",
                        event = "session.initialized",
                        attempt = attempt,
                        "Browser session ready"
                    );
                    return Ok(driver);
                }
                Err(e) => {
                    warn!(
                        component = "session",
                        event = "session.init_attempt_failed",
                        attempt = attempt,
                        error = %e,
                        "Session bring-up attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(BridgeError::SessionInit(last_error))
    }

    async fn try_launch(&self) -> Result<Box<dyn WebSession>, BridgeError> {
        let mut driver = self.backend.launch().await?;
        if let Err(e) = driver.navigate(whatsapp::HOME_URL).await {
            // Half-open session is worse than none
            let _ = driver.close().await;
            return Err(e);
        }
        Ok(driver)
    }

    /// Tear down the session and invalidate every outstanding generation.
    pub async fn reset(&self) {
        let mut slot = self.driver.lock().await;
        if let Some(mut driver) = slot.take() {
            if let Err(e) = driver.close().await {
                warn!(
                    component = "session",
                    event = "session.close_failed",
                    error = %e,
                    "Error closing browser session during reset"
                );
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.publish(false, false);

        info!(
            component = "session",
            event = "session.reset",
            generation = self.generation.load(Ordering::SeqCst),
        );
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// `StaleSession` if the session was reset since `seen` was captured.
    pub fn check_generation(&self, seen: u64) -> Result<(), BridgeError> {
        if self.generation.load(Ordering::SeqCst) != seen {
            return Err(BridgeError::StaleSession);
        }
        Ok(())
    }

    /// Lock-free status snapshot for the dashboard.
    pub fn status(&self) -> SessionStatusInfo {
        **self.status.load()
    }

    /// Periodic status refresh. Skipped entirely when the session is busy;
    /// the dashboard then keeps seeing the last published snapshot.
    pub async fn refresh_status(&self) {
        let Ok(mut slot) = self.driver.try_lock() else {
            return;
        };

        let initialized = slot.is_some();
        let authenticated = match slot.as_mut() {
            Some(driver) => driver
                .wait_for_selector(whatsapp::AUTHENTICATED_MARKER, STATUS_PROBE_TIMEOUT)
                .await
                .is_ok(),
            None => false,
        };
        self.publish(initialized, authenticated);
    }

    /// Reload the page in place, keeping the session generation.
    pub async fn reload(&self) -> Result<(), BridgeError> {
        let mut guard = self.acquire().await?;
        guard.driver().reload().await
    }

    /// Viewport PNG of whatever the session currently shows.
    pub async fn capture_screenshot(&self) -> Result<Vec<u8>, BridgeError> {
        let mut guard = self.acquire().await?;
        guard.driver().screenshot().await
    }

    fn publish(&self, initialized: bool, authenticated: bool) {
        self.status.store(Arc::new(SessionStatusInfo {
            initialized,
            authenticated,
        }));
    }
}

/// Exclusive handle to the live session. Holding the guard blocks every
/// other driver, so keep hold times short.
pub struct SessionGuard<'a> {
    manager: &'a SessionManager,
    generation: u64,
    slot: MutexGuard<'a, Option<Box<dyn WebSession>>>,
}

impl SessionGuard<'_> {
    pub fn driver(&mut self) -> &mut dyn WebSession {
        self.slot
            .as_mut()
            .expect("guard is only constructed over a live session")
            .as_mut()
    }

    /// Generation at acquire time; compare via `check_generation` after
    /// releasing the guard.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the web app shows its authenticated surface within
    /// `timeout`. Absence is an answer, not an error.
    pub async fn probe_authenticated(&mut self, timeout: Duration) -> bool {
        let authenticated = self
            .driver()
            .wait_for_selector(whatsapp::AUTHENTICATED_MARKER, timeout)
            .await
            .is_ok();
        self.manager.publish(true, authenticated);
        authenticated
    }
}
