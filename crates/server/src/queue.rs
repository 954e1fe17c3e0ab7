//! Dispatch queue - FIFO, single worker, one message in flight.
//!
//! Jobs arrive over an mpsc channel and are drained by exactly one worker
//! task, so ordering and non-overlap fall out of the channel itself rather
//! than a timer racing a drain call. Enqueue writes the pending record
//! durably before handing the job to the worker; the HTTP caller never
//! waits on delivery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use donatrack_bridge::BridgeError;
use donatrack_protocol::NotificationRecord;

use crate::delivery::Deliverer;
use crate::persistence::{self, PersistCommand};
use crate::session::SessionManager;

/// Periodic housekeeping cadence while the worker is otherwise idle.
const TICK_INTERVAL: Duration = Duration::from_secs(2);

const JOB_CHANNEL_CAPACITY: usize = 1024;

pub type JobOutcome = Result<(), BridgeError>;

struct DispatchJob {
    record_id: String,
    phone: String,
    body: String,
    /// Present for awaited re-dispatch (recovery sweep); absent for
    /// fire-and-forget enqueues.
    outcome_tx: Option<oneshot::Sender<JobOutcome>>,
}

enum QueueControl {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
}

/// Handle for submitting work to the dispatch worker.
#[derive(Clone)]
pub struct DispatchQueue {
    job_tx: mpsc::Sender<DispatchJob>,
    control_tx: mpsc::Sender<QueueControl>,
    db_path: PathBuf,
}

impl DispatchQueue {
    pub fn spawn(
        session: Arc<SessionManager>,
        deliverer: Arc<dyn Deliverer>,
        persist_tx: mpsc::Sender<PersistCommand>,
        db_path: PathBuf,
        artifact_dir: PathBuf,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(16);

        let worker = QueueWorker {
            session,
            deliverer,
            persist_tx,
            artifact_dir,
            job_rx,
            control_rx,
            paused: false,
        };
        tokio::spawn(worker.run());

        Self {
            job_tx,
            control_tx,
            db_path,
        }
    }

    /// Create a pending record and hand it to the worker. Returns as soon
    /// as the record is durable; delivery happens in the background.
    pub async fn enqueue(
        &self,
        contact_id: &str,
        phone: &str,
        body: &str,
    ) -> anyhow::Result<NotificationRecord> {
        let record =
            persistence::insert_pending_notification(&self.db_path, contact_id, phone, body)
                .await?;

        let job = DispatchJob {
            record_id: record.id.clone(),
            phone: record.phone.clone(),
            body: record.body.clone(),
            outcome_tx: None,
        };
        if self.job_tx.send(job).await.is_err() {
            // Worker halted (fatal session failure). The record stays
            // pending; an operator can retry it by id once the session
            // comes back after a restart.
            warn!(
                component = "queue",
                event = "queue.worker_unavailable",
                record_id = %record.id,
                "Dispatch worker is not running; record left pending"
            );
        }

        Ok(record)
    }

    /// Re-dispatch an existing record through the same worker, with the
    /// outcome reported back. Used by the recovery sweep.
    pub async fn enqueue_existing(
        &self,
        record: &NotificationRecord,
    ) -> oneshot::Receiver<JobOutcome> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let job = DispatchJob {
            record_id: record.id.clone(),
            phone: record.phone.clone(),
            body: record.body.clone(),
            outcome_tx: Some(outcome_tx),
        };
        if let Err(mpsc::error::SendError(job)) = self.job_tx.send(job).await {
            if let Some(tx) = job.outcome_tx {
                let _ = tx.send(Err(BridgeError::SessionInit(
                    "dispatch worker is not running".into(),
                )));
            }
        }
        outcome_rx
    }

    /// Stop picking up new jobs. The in-flight job, if any, completes.
    pub async fn pause(&self) {
        self.control(QueueControl::Pause).await;
    }

    pub async fn resume(&self) {
        self.control(QueueControl::Resume).await;
    }

    async fn control(&self, make: impl FnOnce(oneshot::Sender<()>) -> QueueControl) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control_tx.send(make(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct QueueWorker {
    session: Arc<SessionManager>,
    deliverer: Arc<dyn Deliverer>,
    persist_tx: mpsc::Sender<PersistCommand>,
    artifact_dir: PathBuf,
    job_rx: mpsc::Receiver<DispatchJob>,
    control_rx: mpsc::Receiver<QueueControl>,
    paused: bool,
}

impl QueueWorker {
    async fn run(mut self) {
        info!(component = "queue", event = "queue.worker_started");
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                control = self.control_rx.recv() => {
                    let Some(control) = control else { break };
                    self.apply_control(control);
                }

                job = self.job_rx.recv(), if !self.paused => {
                    let Some(job) = job else { break };
                    if let Err(e) = self.run_job(job).await {
                        error!(
                            component = "queue",
                            event = "queue.worker_halted",
                            error = %e,
                            "Session bring-up failed permanently; halting dispatch"
                        );
                        break;
                    }
                }

                _ = tick.tick() => {
                    self.session.refresh_status().await;
                }
            }
        }

        info!(component = "queue", event = "queue.worker_stopped");
    }

    fn apply_control(&mut self, control: QueueControl) {
        match control {
            QueueControl::Pause(ack) => {
                self.paused = true;
                info!(component = "queue", event = "queue.paused");
                let _ = ack.send(());
            }
            QueueControl::Resume(ack) => {
                self.paused = false;
                info!(component = "queue", event = "queue.resumed");
                let _ = ack.send(());
            }
        }
    }

    /// Run one job to completion. `Err` means session bring-up is broken
    /// beyond the self-heal path and the worker must halt.
    async fn run_job(&mut self, job: DispatchJob) -> Result<(), BridgeError> {
        // Bring the session up before capturing the generation, so a lazy
        // first init does not read as a mid-flight reset.
        let generation = match self.session.acquire().await {
            Ok(guard) => guard.generation(),
            Err(e) => {
                let msg = e.to_string();
                respond(job.outcome_tx, Err(e));
                return Err(BridgeError::SessionInit(msg));
            }
        };

        match self.deliverer.deliver(&job.phone, &job.body).await {
            Ok(()) => {
                if self.session.check_generation(generation).is_err() {
                    // Reset raced the delivery; do not trust the outcome.
                    self.abort_stale(job).await;
                    return Ok(());
                }

                self.persist(PersistCommand::NotificationDelivered {
                    id: job.record_id.clone(),
                })
                .await;
                respond(job.outcome_tx, Ok(()));
                Ok(())
            }

            Err(e) if matches!(e, BridgeError::SessionInit(_)) => {
                let msg = e.to_string();
                respond(job.outcome_tx, Err(e));
                Err(BridgeError::SessionInit(msg))
            }

            Err(e) => {
                if self.session.check_generation(generation).is_err() {
                    self.abort_stale(job).await;
                    return Ok(());
                }

                let artifact = self.capture_failure_artifact(&job.record_id).await;
                warn!(
                    component = "queue",
                    event = "queue.job_failed",
                    record_id = %job.record_id,
                    recipient = %job.phone,
                    error = %e,
                    artifact = artifact.as_deref().unwrap_or("none"),
                    "Delivery failed; record marked failed"
                );
                self.persist(PersistCommand::NotificationFailed {
                    id: job.record_id.clone(),
                    error: e.to_string(),
                    artifact,
                })
                .await;
                respond(job.outcome_tx, Err(e));

                // Self-heal: a wedged page poisons every later job, so
                // restart the session before touching the next one.
                self.session.reset().await;
                match self.session.acquire().await {
                    Ok(_) => Ok(()),
                    Err(heal_err) => Err(heal_err),
                }
            }
        }
    }

    /// A reset invalidated the session while this job was on the wire, so
    /// the delivery outcome cannot be trusted. Mark the record failed; the
    /// recovery sweep re-dispatches it against the fresh session.
    async fn abort_stale(&self, job: DispatchJob) {
        info!(
            component = "queue",
            event = "queue.job_stale",
            record_id = %job.record_id,
            "Session reset mid-delivery; record marked failed for retry"
        );
        self.persist(PersistCommand::NotificationFailed {
            id: job.record_id.clone(),
            error: BridgeError::StaleSession.to_string(),
            artifact: None,
        })
        .await;
        respond(job.outcome_tx, Err(BridgeError::StaleSession));
    }

    /// Best-effort screenshot of the failed state, saved under the public
    /// artifacts dir so operators can see what the page looked like.
    async fn capture_failure_artifact(&self, record_id: &str) -> Option<String> {
        let png = match self.session.capture_screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!(
                    component = "queue",
                    event = "queue.artifact_failed",
                    record_id = %record_id,
                    error = %e,
                    "Could not capture failure screenshot"
                );
                return None;
            }
        };

        let filename = format!("{record_id}.png");
        let path = self.artifact_dir.join(&filename);
        if let Err(e) = tokio::fs::write(&path, png).await {
            warn!(
                component = "queue",
                event = "queue.artifact_failed",
                record_id = %record_id,
                error = %e,
                "Could not write failure screenshot"
            );
            return None;
        }

        Some(format!("/whatsapp/errors/{filename}"))
    }

    async fn persist(&self, cmd: PersistCommand) {
        if self.persist_tx.send(cmd).await.is_err() {
            error!(
                component = "queue",
                event = "queue.persist_unavailable",
                "Persistence writer is gone; outcome not recorded"
            );
        }
    }
}

fn respond(tx: Option<oneshot::Sender<JobOutcome>>, outcome: JobOutcome) {
    if let Some(tx) = tx {
        let _ = tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration_runner::run_migrations;
    use crate::persistence::PersistenceWriter;
    use crate::testutil::{FakeBackend, FakeDeliverer, FakeState};
    use donatrack_protocol::NotificationStatus;
    use std::sync::atomic::Ordering;

    struct Harness {
        queue: DispatchQueue,
        session: Arc<SessionManager>,
        deliverer: Arc<FakeDeliverer>,
        state: Arc<FakeState>,
        db_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness(deliverer: FakeDeliverer) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let mut conn = rusqlite::Connection::open(&db_path).unwrap();
        run_migrations(&mut conn).unwrap();
        drop(conn);

        let artifact_dir = dir.path().join("errors");
        std::fs::create_dir_all(&artifact_dir).unwrap();

        let (backend, state) = FakeBackend::new();
        state.authenticated.store(true, Ordering::SeqCst);
        let session = Arc::new(SessionManager::new(Box::new(backend)));

        let (persist_tx, persist_rx) = persistence::create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

        let deliverer = Arc::new(deliverer);
        let queue = DispatchQueue::spawn(
            session.clone(),
            deliverer.clone(),
            persist_tx,
            db_path.clone(),
            artifact_dir,
        );

        Harness {
            queue,
            session,
            deliverer,
            state,
            db_path,
            _dir: dir,
        }
    }

    async fn contact_for(h: &Harness) -> donatrack_protocol::Contact {
        persistence::find_or_create_contact(&h.db_path, "911234", None, None)
            .await
            .unwrap()
    }

    async fn record_for(h: &Harness, body: &str) -> NotificationRecord {
        let contact = contact_for(h).await;
        persistence::insert_pending_notification(&h.db_path, &contact.id, &contact.phone, body)
            .await
            .unwrap()
    }

    async fn wait_for_status(
        h: &Harness,
        id: &str,
        want: NotificationStatus,
    ) -> NotificationRecord {
        for _ in 0..100 {
            let record = persistence::load_notification(&h.db_path, id)
                .await
                .unwrap()
                .unwrap();
            if record.status == want {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("record {id} never reached {want:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_one_at_a_time_in_order() {
        let h = harness(FakeDeliverer::with_delay(Duration::from_millis(100)));

        let mut outcomes = Vec::new();
        for i in 0..5 {
            let record = record_for(&h, &format!("msg-{i}")).await;
            outcomes.push(h.queue.enqueue_existing(&record).await);
        }
        for rx in outcomes {
            rx.await.unwrap().unwrap();
        }

        assert!(!h.deliverer.overlap.load(Ordering::SeqCst));
        let delivered = h.deliverer.delivered.lock().unwrap();
        let bodies: Vec<&str> = delivered.iter().map(|(_, b)| b.as_str()).collect();
        assert_eq!(bodies, ["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_writes_one_pending_record_then_delivers() {
        let h = harness(FakeDeliverer::new());

        let contact = contact_for(&h).await;
        let record = h
            .queue
            .enqueue(&contact.id, &contact.phone, "hello")
            .await
            .unwrap();
        let loaded = persistence::load_notification(&h.db_path, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, NotificationStatus::Pending);

        wait_for_status(&h, &record.id, NotificationStatus::Delivered).await;
        assert_eq!(h.deliverer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_records_error_artifact_and_restarts_session() {
        let h = harness(FakeDeliverer::new());
        h.deliverer.push_failure("composer never appeared");

        let record = record_for(&h, "doomed").await;
        let rx = h.queue.enqueue_existing(&record).await;
        assert!(rx.await.unwrap().is_err());

        let failed = wait_for_status(&h, &record.id, NotificationStatus::Failed).await;
        assert_eq!(
            failed.last_error.as_deref(),
            Some("transient session error: composer never appeared")
        );
        let artifact = failed.artifact.unwrap();
        assert!(artifact.ends_with(&format!("{}.png", record.id)));
        assert_eq!(h.state.screenshots.load(Ordering::SeqCst), 1);

        // Self-heal relaunched the browser
        assert!(h.state.launches.load(Ordering::SeqCst) >= 2);

        // The queue keeps working afterwards
        let next = record_for(&h, "after").await;
        let rx = h.queue.enqueue_existing(&next).await;
        rx.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reset_mid_delivery_marks_record_failed_and_sweepable() {
        let h = harness(FakeDeliverer::with_delay(Duration::from_millis(200)));

        let record = record_for(&h, "racy").await;
        let rx = h.queue.enqueue_existing(&record).await;

        // Let the worker pick up the job, then yank the session under it
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.session.reset().await;

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(BridgeError::StaleSession)));

        let failed = wait_for_status(&h, &record.id, NotificationStatus::Failed).await;
        assert_eq!(
            failed.last_error.as_deref(),
            Some("session generation changed mid-operation")
        );
        assert!(failed.artifact.is_none());

        // The sweep finds it and redelivers against the fresh session
        let swept = crate::sweep::retry_all_failed(&h.queue, &h.db_path)
            .await
            .unwrap();
        assert_eq!(swept.succeeded, 1);
        assert_eq!(swept.failed, 0);
        wait_for_status(&h, &record.id, NotificationStatus::Delivered).await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_defers_jobs_until_resume() {
        let h = harness(FakeDeliverer::new());

        h.queue.pause().await;
        let first = record_for(&h, "one").await;
        let second = record_for(&h, "two").await;
        let rx1 = h.queue.enqueue_existing(&first).await;
        let rx2 = h.queue.enqueue_existing(&second).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.deliverer.calls.load(Ordering::SeqCst), 0);

        h.queue.resume().await;
        rx1.await.unwrap().unwrap();
        rx2.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_bring_up_halts_dispatch() {
        let h = harness(FakeDeliverer::new());
        h.session.reset().await;
        h.state.launch_failures.store(1000, Ordering::SeqCst);

        let record = record_for(&h, "never").await;
        let rx = h.queue.enqueue_existing(&record).await;
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(BridgeError::SessionInit(_))));

        // Worker is gone; later submissions report the halt immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        let next = record_for(&h, "after-halt").await;
        let rx = h.queue.enqueue_existing(&next).await;
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::SessionInit(_))));
    }
}
