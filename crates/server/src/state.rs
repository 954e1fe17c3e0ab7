//! Shared application state for HTTP handlers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::login::WatchSlot;
use crate::queue::DispatchQueue;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionManager>,
    pub queue: DispatchQueue,
    pub db_path: PathBuf,
    pub qr_path: PathBuf,
    /// When set, `/api/*` requires `Authorization: Bearer <token>`.
    pub auth_token: Option<Arc<str>>,
    /// Admits at most one authentication watch, however often the
    /// dashboard polls the login endpoint.
    pub login_watch: Arc<WatchSlot>,
}
