//! Data-directory layout.
//!
//! One root, resolved at startup (CLI `--data-dir`, then the
//! `DONATRACK_DATA_DIR` env var, then `~/.donatrack`), with every file the
//! server touches hanging off it:
//!
//! ```text
//! <data_dir>/donatrack.db         SQLite database
//! <data_dir>/logs/                server log
//! <data_dir>/browser/             persistent browser profile
//! <data_dir>/public/whatsapp/     served artifacts (QR, screenshots)
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Resolve and pin the data directory for the process. Must run before
/// any of the path helpers below.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = resolve(explicit);
    *DATA_DIR.write().expect("DATA_DIR lock poisoned") = Some(dir.clone());
    dir
}

fn resolve(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var("DONATRACK_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .expect("HOME directory not found")
        .join(".donatrack")
}

pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn db_path() -> PathBuf {
    data_dir().join("donatrack.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Browser profile dir; keeps the messaging login across restarts.
pub fn browser_profile_dir() -> PathBuf {
    data_dir().join("browser")
}

/// Root of the statically-served artifact tree.
pub fn public_dir() -> PathBuf {
    data_dir().join("public")
}

pub fn qr_artifact_path() -> PathBuf {
    public_dir().join("whatsapp").join("qr.svg")
}

pub fn error_artifacts_dir() -> PathBuf {
    public_dir().join("whatsapp").join("errors")
}

/// Create the directory tree up front so artifact writes never race
/// directory creation.
pub fn ensure_dirs() -> io::Result<()> {
    for dir in [
        data_dir(),
        log_dir(),
        browser_profile_dir(),
        error_artifacts_dir(),
    ] {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
