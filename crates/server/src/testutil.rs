//! Shared fakes for exercising the dispatch pipeline without a browser.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use donatrack_bridge::whatsapp;
use donatrack_bridge::{BridgeError, SessionBackend, WebSession};

use crate::delivery::Deliverer;

/// Observable state shared between a `FakeBackend`, the sessions it hands
/// out, and the test body.
#[derive(Default)]
pub struct FakeState {
    pub launches: AtomicUsize,
    /// Fail this many launches before succeeding.
    pub launch_failures: AtomicUsize,
    /// Controls whether the authenticated marker "exists".
    pub authenticated: AtomicBool,
    pub navigations: Mutex<Vec<String>>,
    /// Scripted transient errors for navigations other than bring-up.
    pub nav_errors: Mutex<VecDeque<String>>,
    /// Scripted `data-ref` payloads for the login challenge; `None` means
    /// the challenge is gone.
    pub challenge_refs: Mutex<VecDeque<Option<String>>>,
    pub clicks: Mutex<Vec<String>>,
    pub enters: AtomicUsize,
    pub screenshots: AtomicUsize,
    pub cleared: AtomicUsize,
    pub closed: AtomicUsize,
}

pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new() -> (Self, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

#[async_trait]
impl SessionBackend for FakeBackend {
    async fn launch(&self) -> Result<Box<dyn WebSession>, BridgeError> {
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        if self.state.launch_failures.load(Ordering::SeqCst) > 0 {
            self.state.launch_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(BridgeError::Transient("launch refused".into()));
        }
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

pub struct FakeSession {
    state: Arc<FakeState>,
}

#[async_trait]
impl WebSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BridgeError> {
        self.state.navigations.lock().unwrap().push(url.to_string());
        if url != whatsapp::HOME_URL {
            if let Some(err) = self.state.nav_errors.lock().unwrap().pop_front() {
                return Err(BridgeError::Transient(err));
            }
        }
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        css: &str,
        _timeout: Duration,
    ) -> Result<(), BridgeError> {
        if css == whatsapp::AUTHENTICATED_MARKER
            && !self.state.authenticated.load(Ordering::SeqCst)
        {
            return Err(BridgeError::Timeout(css.to_string()));
        }
        Ok(())
    }

    async fn query_attribute(
        &mut self,
        _css: &str,
        _attr: &str,
    ) -> Result<Option<String>, BridgeError> {
        Ok(self
            .state
            .challenge_refs
            .lock()
            .unwrap()
            .pop_front()
            .flatten())
    }

    async fn press_enter(&mut self) -> Result<(), BridgeError> {
        self.state.enters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn click(&mut self, css: &str) -> Result<(), BridgeError> {
        self.state.clicks.lock().unwrap().push(css.to_string());
        Ok(())
    }

    async fn wait_for_network_idle(&mut self, _timeout: Duration) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BridgeError> {
        self.state.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn clear_local_state(&mut self) -> Result<(), BridgeError> {
        self.state.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scriptable stand-in for the delivery engine. Detects overlapping
/// deliveries, which the single-worker queue must never produce.
pub struct FakeDeliverer {
    busy: AtomicBool,
    pub overlap: AtomicBool,
    pub delay: Duration,
    pub outcomes: Mutex<VecDeque<Result<(), BridgeError>>>,
    pub delivered: Mutex<Vec<(String, String)>>,
    pub calls: AtomicUsize,
}

impl FakeDeliverer {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            busy: AtomicBool::new(false),
            overlap: AtomicBool::new(false),
            delay,
            outcomes: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_failure(&self, message: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Err(BridgeError::Transient(message.into())));
    }
}

#[async_trait]
impl Deliverer for FakeDeliverer {
    async fn deliver(&self, phone: &str, body: &str) -> Result<(), BridgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.busy.store(false, Ordering::SeqCst);

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.delivered
                .lock()
                .unwrap()
                .push((phone.to_string(), body.to_string()));
        }
        outcome
    }
}
