//! Donatrack server
//!
//! Donation tracking with WhatsApp notifications. Contributions arrive
//! over REST, get recorded in SQLite, and their thank-you messages are
//! pushed through a single-worker dispatch queue driving a headless
//! browser session.

mod auth;
mod contributions;
mod delivery;
mod http;
mod logging;
mod login;
mod migration_runner;
mod paths;
mod persistence;
mod queue;
mod session;
mod state;
mod sweep;
#[cfg(test)]
mod testutil;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use donatrack_bridge::{ChromiumBackend, LaunchOptions};

use crate::delivery::DeliveryEngine;
use crate::persistence::{create_persistence_channel, PersistenceWriter};
use crate::queue::DispatchQueue;
use crate::session::SessionManager;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "donatrack", about = "Donation tracking with WhatsApp notifications")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "DONATRACK_PORT", default_value_t = 4000)]
    port: u16,

    /// Data directory (defaults to DONATRACK_DATA_DIR or ~/.donatrack)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Require `Authorization: Bearer <token>` on /api routes
    #[arg(long, env = "DONATRACK_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Run the browser headless
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    headless: bool,

    /// Explicit browser binary (defaults to `chromium` on PATH)
    #[arg(long)]
    browser_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    paths::init_data_dir(args.data_dir.as_deref());
    paths::ensure_dirs()?;
    let _logging = logging::init_logging()?;

    info!(
        component = "server",
        event = "server.starting",
        data_dir = %paths::data_dir().display(),
    );

    let db_path = paths::db_path();
    {
        let mut conn = rusqlite::Connection::open(&db_path)?;
        migration_runner::run_migrations(&mut conn)?;
    }

    let (persist_tx, persist_rx) = create_persistence_channel();
    tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

    let mut launch_opts = LaunchOptions::new(paths::browser_profile_dir());
    launch_opts.headless = args.headless;
    launch_opts.browser_path = args.browser_path;
    let session = Arc::new(SessionManager::new(Box::new(ChromiumBackend::new(
        launch_opts,
    ))));

    let deliverer = Arc::new(DeliveryEngine::new(session.clone()));
    let queue = DispatchQueue::spawn(
        session.clone(),
        deliverer,
        persist_tx,
        db_path.clone(),
        paths::error_artifacts_dir(),
    );

    let state = AppState {
        session,
        queue,
        db_path,
        qr_path: paths::qr_artifact_path(),
        auth_token: args.auth_token.map(Arc::from),
        login_watch: Arc::new(login::WatchSlot::new()),
    };
    let app = http::router(state, paths::public_dir());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(
        component = "server",
        event = "server.listening",
        addr = %addr,
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
