//! Persistence layer - batched SQLite writes
//!
//! Uses `spawn_blocking` for async-safe SQLite access.
//! Outcome updates (delivered/failed) flow through the batched writer;
//! record creation is synchronous so enqueue is durable before it returns.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use donatrack_protocol::{new_id, Contact, Contribution, NotificationRecord, NotificationStatus};

const MAX_BATCH: usize = 50;
const FLUSH_EVERY: Duration = Duration::from_millis(100);

/// Commands that can be persisted
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Mark a notification delivered; clears any previous error
    NotificationDelivered { id: String },

    /// Mark a notification failed with the final error and, when one was
    /// captured, a failure-screenshot reference
    NotificationFailed {
        id: String,
        error: String,
        artifact: Option<String>,
    },
}

/// Single writer task draining the persist channel into SQLite in small
/// batches.
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    buffer: Vec<PersistCommand>,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            buffer: Vec::new(),
        }
    }

    /// Drain the channel until every sender is gone, then flush what's left.
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.writer_started",
            db = %self.db_path.display(),
        );

        let mut flush_tick = tokio::time::interval(FLUSH_EVERY);
        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.buffer.push(cmd);
                            if self.buffer.len() >= MAX_BATCH {
                                self.flush().await;
                            }
                        }
                        None => break,
                    }
                }

                _ = flush_tick.tick(), if !self.buffer.is_empty() => {
                    self.flush().await;
                }
            }
        }

        self.flush().await;
        info!(
            component = "persistence",
            event = "persistence.writer_stopped",
        );
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let commands = std::mem::take(&mut self.buffer);
        let db_path = self.db_path.clone();
        let written = tokio::task::spawn_blocking(move || write_batch(&db_path, commands)).await;

        match written {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    commands = count,
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                );
            }
        }
    }
}

/// Apply a batch inside one transaction (runs on a blocking thread). A
/// command that fails is logged and skipped; the rest of the batch lands.
fn write_batch(db_path: &Path, commands: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open(db_path)?;
    let count = commands.len();

    let tx = conn.unchecked_transaction()?;
    for cmd in commands {
        if let Err(e) = apply(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
            );
        }
    }
    tx.commit()?;

    Ok(count)
}

fn apply(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::NotificationDelivered { id } => {
            conn.execute(
                "UPDATE notifications SET status = 'delivered', last_error = NULL WHERE id = ?1",
                params![id],
            )?;
        }

        PersistCommand::NotificationFailed {
            id,
            error,
            artifact,
        } => {
            conn.execute(
                "UPDATE notifications
                 SET status = 'failed',
                     last_error = ?2,
                     artifact = COALESCE(?3, artifact)
                 WHERE id = ?1",
                params![id, error, artifact],
            )?;
        }
    }

    Ok(())
}

fn open(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Blocking helpers (opened per call, spawn_blocking wrapped)
// ---------------------------------------------------------------------------

/// Insert a pending NotificationRecord. Durable before return.
pub async fn insert_pending_notification(
    db_path: &Path,
    contact_id: &str,
    phone: &str,
    body: &str,
) -> anyhow::Result<NotificationRecord> {
    let db_path = db_path.to_path_buf();
    let record = NotificationRecord {
        id: new_id(),
        contact_id: contact_id.to_string(),
        phone: phone.to_string(),
        body: body.to_string(),
        status: NotificationStatus::Pending,
        last_error: None,
        artifact: None,
        created_at: now_iso8601(),
    };

    let stored = record.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let conn = open(&db_path)?;
        conn.execute(
            "INSERT INTO notifications (id, contact_id, phone, body, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                stored.id,
                stored.contact_id,
                stored.phone,
                stored.body,
                stored.created_at
            ],
        )?;
        Ok(())
    })
    .await??;

    Ok(record)
}

/// Load every notification with status = failed
pub async fn load_failed_notifications(db_path: &Path) -> anyhow::Result<Vec<NotificationRecord>> {
    let db_path = db_path.to_path_buf();
    let records = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<NotificationRecord>> {
        let conn = open(&db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, contact_id, phone, body, status, last_error, artifact, created_at
             FROM notifications
             WHERE status = 'failed'
             ORDER BY created_at",
        )?;
        let records = stmt
            .query_map([], row_to_record)?
            .filter_map(|r| match r {
                Ok(record) => Some(record),
                Err(e) => {
                    // Skip the unreadable row rather than abort the sweep
                    warn!(
                        component = "persistence",
                        event = "persistence.row_skipped",
                        error = %e,
                        "Could not decode a failed-notification row"
                    );
                    None
                }
            })
            .collect();
        Ok(records)
    })
    .await??;

    Ok(records)
}

/// Load a single notification by id
pub async fn load_notification(
    db_path: &Path,
    id: &str,
) -> anyhow::Result<Option<NotificationRecord>> {
    let db_path = db_path.to_path_buf();
    let id = id.to_string();
    let record = tokio::task::spawn_blocking(
        move || -> anyhow::Result<Option<NotificationRecord>> {
            let conn = open(&db_path)?;
            let record = conn
                .query_row(
                    "SELECT id, contact_id, phone, body, status, last_error, artifact, created_at
                     FROM notifications WHERE id = ?1",
                    params![id],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        },
    )
    .await??;

    Ok(record)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let status_str: String = row.get(4)?;
    Ok(NotificationRecord {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        phone: row.get(2)?,
        body: row.get(3)?,
        status: NotificationStatus::from_str(&status_str).unwrap_or(NotificationStatus::Failed),
        last_error: row.get(5)?,
        artifact: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Find a contact by phone, creating one when absent. Phone is the stable
/// join key across repeated contributions from the same contributor.
pub async fn find_or_create_contact(
    db_path: &Path,
    phone: &str,
    name: Option<&str>,
    email: Option<&str>,
) -> anyhow::Result<Contact> {
    let db_path = db_path.to_path_buf();
    let phone = phone.to_string();
    let name = name.map(String::from);
    let email = email.map(String::from);

    let contact = tokio::task::spawn_blocking(move || -> anyhow::Result<Contact> {
        let conn = open(&db_path)?;

        let existing = conn
            .query_row(
                "SELECT id, name, email, phone, created_at FROM contacts WHERE phone = ?1",
                params![phone],
                |row| {
                    Ok(Contact {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        phone: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        if let Some(contact) = existing {
            return Ok(contact);
        }

        let contact = Contact {
            id: new_id(),
            name,
            email,
            phone,
            created_at: now_iso8601(),
        };
        conn.execute(
            "INSERT INTO contacts (id, name, email, phone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                contact.id,
                contact.name,
                contact.email,
                contact.phone,
                contact.created_at
            ],
        )?;
        Ok(contact)
    })
    .await??;

    Ok(contact)
}

/// Record one contribution against a contact
pub async fn insert_contribution(
    db_path: &Path,
    contact_id: &str,
    amount: i64,
    reference: Option<&str>,
) -> anyhow::Result<Contribution> {
    let db_path = db_path.to_path_buf();
    let contribution = Contribution {
        id: new_id(),
        contact_id: contact_id.to_string(),
        amount,
        reference: reference.map(String::from),
        verified: false,
        created_at: now_iso8601(),
    };

    let stored = contribution.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let conn = open(&db_path)?;
        conn.execute(
            "INSERT INTO contributions (id, contact_id, amount, reference, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stored.id,
                stored.contact_id,
                stored.amount,
                stored.reference,
                stored.created_at
            ],
        )?;
        Ok(())
    })
    .await??;

    Ok(contribution)
}

/// Create the channel feeding the persistence writer
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1000)
}

/// Current UTC time as an ISO 8601 string
pub fn now_iso8601() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    iso8601_utc(secs)
}

/// Format a Unix timestamp as ISO 8601 UTC, via days-to-civil-date
/// conversion (no leap-year loop).
fn iso8601_utc(secs: u64) -> String {
    let time_of_day = secs % 86_400;
    let hour = time_of_day / 3_600;
    let minute = time_of_day % 3_600 / 60;
    let second = time_of_day % 60;

    // Shift the epoch to 0000-03-01 so leap days land at era boundaries
    let z = (secs / 86_400) as i64 + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}
