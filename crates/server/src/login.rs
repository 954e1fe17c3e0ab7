//! Login bridge - QR credential production and the authentication watch.
//!
//! The web app presents its login challenge as a `data-ref` payload that
//! rotates every few seconds. We re-encode the payload as a QR image
//! ourselves (with an audit stamp) instead of screenshotting the page, and
//! keep the served image fresh while the operator scans it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qrcode::render::svg;
use qrcode::QrCode;
use tracing::{info, warn};

use donatrack_bridge::whatsapp;
use donatrack_bridge::BridgeError;
use donatrack_protocol::LoginResponse;

use crate::persistence::now_iso8601;
use crate::session::{SessionManager, AUTH_PROBE_TIMEOUT};

/// How long to wait for the challenge element on a cold page.
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Challenge payload rotation is checked at this cadence.
const LOGIN_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Operator scan window; after this the watch gives up.
const LOGIN_WINDOW: Duration = Duration::from_secs(300);

const MENU_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Claim ticket for the authentication watch. A login endpoint that gets
/// polled must not stack a new watch per request.
#[derive(Default)]
pub struct WatchSlot(AtomicBool);

impl WatchSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the caller now owns the watch and must `release` it when
    /// the watch ends.
    pub fn try_claim(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Whether the session currently shows the authenticated surface.
pub async fn check_authenticated(session: &SessionManager) -> Result<bool, BridgeError> {
    let mut guard = session.acquire().await?;
    Ok(guard.probe_authenticated(AUTH_PROBE_TIMEOUT).await)
}

/// Produce the QR credential image for the current login challenge and
/// report where it is served from. Reports "already authenticated"
/// instead when no login is needed.
pub async fn produce_credential(
    session: &SessionManager,
    qr_path: &Path,
    client: &str,
) -> Result<LoginResponse, BridgeError> {
    let mut guard = session.acquire().await?;

    if guard.probe_authenticated(AUTH_PROBE_TIMEOUT).await {
        return Ok(LoginResponse::AlreadyAuthenticated {
            already_authenticated: true,
        });
    }

    guard
        .driver()
        .wait_for_selector(whatsapp::CHALLENGE_SELECTOR, CHALLENGE_TIMEOUT)
        .await?;
    let payload = guard
        .driver()
        .query_attribute(whatsapp::CHALLENGE_SELECTOR, whatsapp::CHALLENGE_ATTR)
        .await?
        .ok_or(BridgeError::NoCredential)?;

    write_qr(qr_path, &payload, client)?;
    info!(
        component = "login",
        event = "login.credential_produced",
        client = %client,
    );

    Ok(LoginResponse::Credential {
        artifact_url: "/whatsapp/qr.svg".into(),
    })
}

/// Watch the login challenge until the operator scans it. Re-renders the
/// served QR whenever the payload rotates; ends when the authenticated
/// surface appears, the challenge disappears, or the scan window closes.
pub async fn await_authentication(
    session: Arc<SessionManager>,
    qr_path: PathBuf,
    client: String,
) -> Result<(), BridgeError> {
    let deadline = tokio::time::Instant::now() + LOGIN_WINDOW;
    let mut last_payload: Option<String> = None;

    loop {
        // Short hold each poll so the guard does not starve dispatch
        {
            let mut guard = session.acquire().await?;

            if guard.probe_authenticated(Duration::from_secs(1)).await {
                info!(
                    component = "login",
                    event = "login.authenticated",
                    client = %client,
                );
                return Ok(());
            }

            let payload = guard
                .driver()
                .query_attribute(whatsapp::CHALLENGE_SELECTOR, whatsapp::CHALLENGE_ATTR)
                .await?;
            match payload {
                Some(payload) => {
                    if last_payload.as_deref() != Some(payload.as_str()) {
                        write_qr(&qr_path, &payload, &client)?;
                        last_payload = Some(payload);
                    }
                }
                None => {
                    warn!(
                        component = "login",
                        event = "login.challenge_gone",
                        client = %client,
                        "Login challenge disappeared without authentication"
                    );
                    return Err(BridgeError::AuthAborted);
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(BridgeError::Timeout("login scan window".into()));
        }
        tokio::time::sleep(LOGIN_POLL_INTERVAL).await;
    }
}

/// Log out through the web app's own menu flow, then drop local state and
/// reset the session so the next acquire starts clean.
pub async fn logout(session: &SessionManager) -> Result<(), BridgeError> {
    {
        let mut guard = session.acquire().await?;

        if guard.probe_authenticated(AUTH_PROBE_TIMEOUT).await {
            let driver = guard.driver();
            driver.click(whatsapp::MENU_SELECTOR).await?;
            driver
                .wait_for_selector(whatsapp::LOGOUT_ITEM_SELECTOR, MENU_STEP_TIMEOUT)
                .await?;
            driver.click(whatsapp::LOGOUT_ITEM_SELECTOR).await?;
            driver
                .wait_for_selector(whatsapp::LOGOUT_CONFIRM_SELECTOR, MENU_STEP_TIMEOUT)
                .await?;
            driver.click(whatsapp::LOGOUT_CONFIRM_SELECTOR).await?;
        }

        guard.driver().clear_local_state().await?;
    }

    session.reset().await;
    info!(component = "login", event = "login.logged_out");
    Ok(())
}

/// Render the challenge payload as an SVG QR with an audit line naming
/// when and for whom it was produced.
fn write_qr(path: &Path, payload: &str, client: &str) -> Result<(), BridgeError> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| BridgeError::Transient(format!("qr encode failed: {e}")))?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(320, 320)
        .quiet_zone(true)
        .build();

    let stamp = format!(
        "<text x=\"4\" y=\"14\" font-size=\"10\" font-family=\"monospace\">{} {}</text>",
        now_iso8601(),
        client
    );
    let stamped = match image.rfind("</svg>") {
        Some(idx) => format!("{}{}</svg>", &image[..idx], stamp),
        None => image,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, stamped)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeBackend;
    use std::sync::atomic::Ordering;

    fn qr_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("whatsapp").join("qr.svg")
    }

    #[tokio::test]
    async fn authenticated_session_skips_credential() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, state) = FakeBackend::new();
        state.authenticated.store(true, Ordering::SeqCst);
        let session = SessionManager::new(Box::new(backend));

        let resp = produce_credential(&session, &qr_path(&dir), "10.0.0.1")
            .await
            .unwrap();
        assert!(matches!(
            resp,
            LoginResponse::AlreadyAuthenticated {
                already_authenticated: true
            }
        ));
        assert!(!qr_path(&dir).exists());
    }

    #[tokio::test]
    async fn credential_renders_stamped_svg() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, state) = FakeBackend::new();
        state
            .challenge_refs
            .lock()
            .unwrap()
            .push_back(Some("2@challenge-payload".into()));
        let session = SessionManager::new(Box::new(backend));

        let resp = produce_credential(&session, &qr_path(&dir), "10.0.0.7")
            .await
            .unwrap();
        assert!(matches!(resp, LoginResponse::Credential { ref artifact_url }
            if artifact_url == "/whatsapp/qr.svg"));

        let svg = std::fs::read_to_string(qr_path(&dir)).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("10.0.0.7"));
    }

    #[tokio::test]
    async fn missing_challenge_is_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _state) = FakeBackend::new();
        let session = SessionManager::new(Box::new(backend));

        let err = produce_credential(&session, &qr_path(&dir), "10.0.0.1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::NoCredential));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_resolves_when_operator_scans() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, state) = FakeBackend::new();
        state
            .challenge_refs
            .lock()
            .unwrap()
            .push_back(Some("2@first".into()));
        let session = Arc::new(SessionManager::new(Box::new(backend)));

        let watch = tokio::spawn(await_authentication(
            session.clone(),
            qr_path(&dir),
            "10.0.0.1".into(),
        ));

        // First poll renders the QR, then the operator scans
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(qr_path(&dir).exists());
        state.authenticated.store(true, Ordering::SeqCst);

        watch.await.unwrap().unwrap();
        assert!(session.status().authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_aborts_when_challenge_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _state) = FakeBackend::new();
        let session = Arc::new(SessionManager::new(Box::new(backend)));

        let err = await_authentication(session, qr_path(&dir), "10.0.0.1".into())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::AuthAborted));
    }

    #[test]
    fn watch_slot_admits_one_claim_at_a_time() {
        let slot = WatchSlot::new();
        assert!(slot.try_claim());
        assert!(!slot.try_claim());
        assert!(!slot.try_claim());
        slot.release();
        assert!(slot.try_claim());
    }

    #[tokio::test]
    async fn logout_walks_menu_and_resets() {
        let (backend, state) = FakeBackend::new();
        state.authenticated.store(true, Ordering::SeqCst);
        let session = SessionManager::new(Box::new(backend));
        let generation_before = {
            let guard = session.acquire().await.unwrap();
            guard.generation()
        };

        logout(&session).await.unwrap();

        let clicks = state.clicks.lock().unwrap().clone();
        assert_eq!(
            clicks,
            vec![
                whatsapp::MENU_SELECTOR.to_string(),
                whatsapp::LOGOUT_ITEM_SELECTOR.to_string(),
                whatsapp::LOGOUT_CONFIRM_SELECTOR.to_string(),
            ]
        );
        assert_eq!(state.cleared.load(Ordering::SeqCst), 1);
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
        assert_ne!(session.generation(), generation_before);
    }

    #[tokio::test]
    async fn logout_of_logged_out_session_still_clears_state() {
        let (backend, state) = FakeBackend::new();
        let session = SessionManager::new(Box::new(backend));

        logout(&session).await.unwrap();
        assert!(state.clicks.lock().unwrap().is_empty());
        assert_eq!(state.cleared.load(Ordering::SeqCst), 1);
    }
}
