//! Donatrack Bridge
//!
//! The browser-session capability behind the notification dispatcher.
//! Defines the driver seam (`SessionBackend` / `WebSession`), the bridge
//! error taxonomy, and the retry policy value applied by the delivery
//! engine. The production driver speaks CDP to a headless Chromium.

pub mod chromium;
pub mod whatsapp;

pub use chromium::{ChromiumBackend, LaunchOptions};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by the browser session and the components driving it
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Session bring-up exhausted its attempts. Fatal for the dispatch
    /// subsystem; surfaced to operators rather than auto-recovered.
    #[error("session initialization failed: {0}")]
    SessionInit(String),

    /// Recoverable by operator action (re-run the QR login flow).
    #[error("messaging session is not authenticated")]
    NotAuthenticated,

    /// Retried locally by the delivery engine, then surfaced as a job
    /// failure if retries exhaust.
    #[error("transient session error: {0}")]
    Transient(String),

    /// Bounded wait elapsed without the expected surface appearing.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The session was reset while an operation was in flight. The
    /// outcome cannot be trusted; the record is marked failed so the
    /// recovery sweep retries it against the fresh session.
    #[error("session generation changed mid-operation")]
    StaleSession,

    /// Reported to callers as "already authenticated", not as a failure.
    #[error("no login challenge is currently presented")]
    NoCredential,

    /// The challenge disappeared without the authenticated marker showing.
    #[error("login challenge disappeared without authentication")]
    AuthAborted,

    #[error("driver I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("driver protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether the delivery engine may retry after this error.
    /// Auth and staleness propagate immediately; everything session-shaped
    /// (timeouts, navigation hiccups, dropped connections) is retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Transient(_)
                | BridgeError::Timeout(_)
                | BridgeError::Io(_)
                | BridgeError::Protocol(_)
        )
    }
}

/// Bounded retry configuration applied uniformly wherever attempts repeat
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Back-to-back attempts with no inter-attempt delay (infra bring-up,
    /// not traffic shaping).
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// A live page in the automated browser. Exactly one exists per session
/// generation; only the holder of the session guard may drive it.
#[async_trait]
pub trait WebSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BridgeError>;

    async fn reload(&mut self) -> Result<(), BridgeError>;

    /// Resolve once an element matching `css` exists, or `Timeout`.
    async fn wait_for_selector(&mut self, css: &str, timeout: Duration) -> Result<(), BridgeError>;

    /// Read an attribute off the first match, `None` if absent.
    async fn query_attribute(
        &mut self,
        css: &str,
        attr: &str,
    ) -> Result<Option<String>, BridgeError>;

    async fn press_enter(&mut self) -> Result<(), BridgeError>;

    async fn click(&mut self, css: &str) -> Result<(), BridgeError>;

    /// Resolve once no network request has been in flight for a short
    /// settle window, or `Timeout`.
    async fn wait_for_network_idle(&mut self, timeout: Duration) -> Result<(), BridgeError>;

    /// PNG of the current viewport.
    async fn screenshot(&mut self) -> Result<Vec<u8>, BridgeError>;

    /// Drop persisted web-app state (local storage, indexed DB).
    async fn clear_local_state(&mut self) -> Result<(), BridgeError>;

    async fn close(&mut self) -> Result<(), BridgeError>;
}

/// Launches sessions. The server owns one backend for the process lifetime.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn WebSession>, BridgeError>;
}
