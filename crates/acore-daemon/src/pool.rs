//! Bounded sandbox worker pool.
//!
//! `W` workers share a strict-FIFO queue. Admission is governed by a
//! semaphore of `W + Q` permits: a permit is held from acceptance to
//! terminal state, so at most `Q` jobs ever wait and at most `W` run;
//! when no permit is free the service refuses the submission (no
//! silent drop). At startup the pool reserves `W` TAP devices from the
//! host pool and refuses to start with fewer. Each running job owns
//! exactly one TAP, returned by guard on every exit path.
//!
//! Cancellation: queued jobs carry a tombstone flag (O(1) to set;
//! workers skip tombstoned entries); running jobs have their
//! `CancellationToken` cancelled, which SIGTERMs the runner and
//! escalates to SIGKILL.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acore_core::SecretRedactor;
use acore_sandbox::tap::{self, TapLease};
use chrono::Utc;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::exec::{self, ExecError, ExecRequest};
use crate::job::{JobId, JobStatus, JobStore};
use crate::persist::PersistLayout;
use crate::token::{self, AccessTokenManager};

/// Errors refusing a submission.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Queue and workers are all occupied.
    #[error("validator is busy; queue is full")]
    QueueFull,

    /// The pool is shutting down.
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Errors starting the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolStartError {
    /// Not enough TAP devices could be reserved.
    #[error("reserved only {reserved} of {required} TAP devices (prefix '{prefix}')")]
    InsufficientTaps {
        /// Devices successfully reserved.
        reserved: usize,
        /// Workers configured.
        required: usize,
        /// Discovery prefix.
        prefix: String,
    },

    /// TAP enumeration or locking failed outright.
    #[error(transparent)]
    Tap(#[from] tap::TapError),
}

/// Parameters carried by a queued job beyond its store record.
#[derive(Debug)]
pub struct JobParams {
    /// Per-job timeout.
    pub timeout: Duration,
    /// Run guest egress self-checks.
    pub net_checks: bool,
    /// Quiet kernel console.
    pub quiet_kernel: bool,
}

#[derive(Debug)]
struct QueuedJob {
    job_id: JobId,
    params: JobParams,
    tombstone: Arc<AtomicBool>,
    done: oneshot::Sender<()>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct PoolShared {
    queue: Mutex<VecDeque<QueuedJob>>,
    tombstones: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
    running_cancels: Mutex<HashMap<JobId, CancellationToken>>,
    taps: Mutex<Vec<TapLease>>,
    admission: Arc<Semaphore>,
    notify: Notify,
    running: AtomicUsize,
    shutdown: CancellationToken,
}

/// Returns a checked-out TAP lease to the pool free-set exactly once.
struct TapCheckout {
    lease: Option<TapLease>,
    shared: Arc<PoolShared>,
}

impl TapCheckout {
    fn name(&self) -> String {
        self.lease
            .as_ref()
            .map(|l| l.name().to_string())
            .unwrap_or_default()
    }
}

impl Drop for TapCheckout {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.shared
                .taps
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(lease);
        }
    }
}

/// Pool health snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PoolHealth {
    /// Jobs waiting in the queue.
    pub queue_depth: usize,
    /// Configured worker count.
    pub workers_total: usize,
    /// Workers not currently running a job.
    pub workers_idle: usize,
}

/// The bounded worker pool.
#[derive(Debug)]
pub struct WorkerPool {
    config: Arc<DaemonConfig>,
    store: Arc<JobStore>,
    layout: Arc<PersistLayout>,
    tokens: Arc<AccessTokenManager>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Reserves TAP devices and starts `W` workers.
    ///
    /// # Errors
    ///
    /// Returns [`PoolStartError`] when fewer than `W` TAP devices can
    /// be reserved.
    pub fn start(
        config: Arc<DaemonConfig>,
        store: Arc<JobStore>,
        layout: Arc<PersistLayout>,
        tokens: Arc<AccessTokenManager>,
    ) -> Result<Arc<Self>, PoolStartError> {
        let leases = Self::reserve_taps(&config)?;
        info!(
            workers = config.workers,
            queue = config.queue_capacity,
            taps = ?leases.iter().map(TapLease::name).collect::<Vec<_>>(),
            "worker pool starting"
        );

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            tombstones: Mutex::new(HashMap::new()),
            running_cancels: Mutex::new(HashMap::new()),
            taps: Mutex::new(leases),
            admission: Arc::new(Semaphore::new(config.workers + config.queue_capacity)),
            notify: Notify::new(),
            running: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });

        let pool = Arc::new(Self {
            config,
            store,
            layout,
            tokens,
            shared,
        });

        for slot in 0..pool.config.workers {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.supervise_worker(slot).await });
        }
        Ok(pool)
    }

    fn reserve_taps(config: &DaemonConfig) -> Result<Vec<TapLease>, PoolStartError> {
        let names: Vec<String> = match &config.tap_devices {
            Some(explicit) => explicit.clone(),
            None => tap::list_taps(&config.tap_prefix).map_err(tap::TapError::ListFailed)?,
        };

        let mut leases = Vec::with_capacity(config.workers);
        for name in &names {
            if leases.len() == config.workers {
                break;
            }
            match tap::acquire_named(name, &config.tap_lock_dir) {
                Ok(lease) => leases.push(lease),
                Err(err) => warn!(tap = %name, error = %err, "TAP unavailable"),
            }
        }
        if leases.len() < config.workers {
            return Err(PoolStartError::InsufficientTaps {
                reserved: leases.len(),
                required: config.workers,
                prefix: config.tap_prefix.clone(),
            });
        }
        Ok(leases)
    }

    /// Enqueues an already-recorded job.
    ///
    /// Returns a receiver resolved when the job reaches a terminal
    /// state (look the record up in the store for the result).
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::QueueFull`] when no admission permit is
    /// free.
    pub fn submit(
        &self,
        job_id: JobId,
        params: JobParams,
    ) -> Result<oneshot::Receiver<()>, SubmitError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let permit = Arc::clone(&self.shared.admission)
            .try_acquire_owned()
            .map_err(|_| SubmitError::QueueFull)?;

        let (done_tx, done_rx) = oneshot::channel();
        let tombstone = Arc::new(AtomicBool::new(false));
        self.shared
            .tombstones
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(job_id, Arc::clone(&tombstone));

        self.shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(QueuedJob {
                job_id,
                params,
                tombstone,
                done: done_tx,
                _permit: permit,
            });
        self.shared.notify.notify_one();
        Ok(done_rx)
    }

    /// Cancels a job: a tombstone for queued jobs (O(1), no worker
    /// involved), a token cancellation for running jobs.
    ///
    /// Returns `true` when the job was known to the pool.
    pub fn cancel(&self, job_id: JobId) -> bool {
        if let Some(flag) = self
            .shared
            .tombstones
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&job_id)
        {
            flag.store(true, Ordering::SeqCst);
            return true;
        }
        if let Some(cancel) = self
            .shared
            .running_cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&job_id)
        {
            cancel.cancel();
            return true;
        }
        false
    }

    /// Health snapshot.
    #[must_use]
    pub fn health(&self) -> PoolHealth {
        let queue_depth = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        let running = self.shared.running.load(Ordering::Relaxed);
        PoolHealth {
            queue_depth,
            workers_total: self.config.workers,
            workers_idle: self.config.workers.saturating_sub(running),
        }
    }

    /// Begins shutdown: running jobs are cancelled, waiting workers
    /// exit.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        for cancel in self
            .shared
            .running_cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
        {
            cancel.cancel();
        }
        self.shared.notify.notify_waiters();
    }

    async fn supervise_worker(self: Arc<Self>, slot: usize) {
        loop {
            let pool = Arc::clone(&self);
            let handle = tokio::spawn(async move { pool.worker_loop(slot).await });
            match handle.await {
                Ok(()) => break,
                Err(join_err) => {
                    // A worker must never take the pool down with it.
                    error!(slot, error = %join_err, "worker crashed; replacing");
                }
            }
            if self.shared.shutdown.is_cancelled() {
                break;
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, slot: usize) {
        info!(slot, "worker started");
        while let Some(job) = self.next_job().await {
            if job.tombstone.load(Ordering::SeqCst) {
                self.finish_cancelled_before_start(&job);
                let _ = job.done.send(());
                continue;
            }

            self.shared.running.fetch_add(1, Ordering::SeqCst);
            self.process(&job).await;
            self.shared.running.fetch_sub(1, Ordering::SeqCst);
            let _ = job.done.send(());
        }
        info!(slot, "worker stopped");
    }

    async fn next_job(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut queue = self
                    .shared
                    .queue
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(job) = queue.pop_front() {
                    self.shared
                        .tombstones
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .remove(&job.job_id);
                    return Some(job);
                }
            }
            if self.shared.shutdown.is_cancelled() {
                return None;
            }
            tokio::select! {
                () = notified => {}
                () = self.shared.shutdown.cancelled() => return None,
            }
        }
    }

    fn finish_cancelled_before_start(&self, job: &QueuedJob) {
        let record = self.store.update(job.job_id, |r| {
            r.status = JobStatus::Cancelled;
            r.finished_at = Some(Utc::now());
            r.error = Some("cancelled while queued".to_string());
        });
        let _ = std::fs::remove_dir_all(self.layout.workspace_dir(job.job_id));
        if let Some(record) = record {
            if let Err(err) = self.layout.write_job_record(&record) {
                warn!(job_id = %job.job_id, error = %err, "cannot persist cancelled record");
            }
        }
    }

    async fn process(&self, job: &QueuedJob) {
        let job_id = job.job_id;
        let Some(record) = self.store.get(job_id) else {
            warn!(%job_id, "dequeued job has no record");
            return;
        };

        // One TAP per running job, returned by guard on every path.
        let checkout = {
            let lease = self
                .shared
                .taps
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop();
            TapCheckout {
                lease,
                shared: Arc::clone(&self.shared),
            }
        };
        if checkout.lease.is_none() {
            self.finalize_failure(job_id, "no TAP device available for worker");
            return;
        }
        let tap_name = checkout.name();

        let started = self.store.update(job_id, |r| {
            r.status = JobStatus::Running;
            r.started_at = Some(Utc::now());
            r.tap_device = Some(tap_name.clone());
        });
        self.persist(started.as_ref());
        info!(%job_id, tap = %tap_name, "job started");

        let token_secret = match self.tokens.current_token().await {
            Ok(token) => token,
            Err(err) => {
                self.finalize_failure(job_id, &format!("credential manager not ready: {err}"));
                return;
            }
        };
        let redactor = SecretRedactor::new().with_secret(token::expose(&token_secret));

        let cancel = CancellationToken::new();
        self.shared
            .running_cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(job_id, cancel.clone());

        let workspace_dir = self.layout.workspace_dir(job_id);
        let request = ExecRequest {
            job_id,
            workspace_dir: &workspace_dir,
            task_spec: &record.task_spec,
            timeout: job.params.timeout,
            net_checks: job.params.net_checks,
            quiet_kernel: job.params.quiet_kernel,
            tap_device: &tap_name,
            log_path: &record.log_path,
        };

        let result = exec::run_sandbox(&self.config, &request, &token_secret, &redactor, &cancel)
            .await;

        self.shared
            .running_cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&job_id);
        let _ = std::fs::remove_dir_all(&workspace_dir);

        let finished = match result {
            Ok(outcome) => {
                let passed = outcome.report.verdict.passed();
                let mut verdict = outcome.report.verdict;
                verdict.logs_ref = Some(format!("/validate/{job_id}/log"));
                self.store.update(job_id, |r| {
                    r.status = if passed { JobStatus::Done } else { JobStatus::Failed };
                    r.finished_at = Some(Utc::now());
                    r.result = Some(verdict.clone());
                    r.log_tail = Some(outcome.tail.clone());
                    r.tap_device = None;
                })
            }
            Err(ExecError::Cancelled) => self.store.update(job_id, |r| {
                r.status = JobStatus::Cancelled;
                r.finished_at = Some(Utc::now());
                r.error = Some("cancelled while running".to_string());
                r.tap_device = None;
            }),
            Err(err) => {
                warn!(%job_id, error = %err, "sandbox invocation failed");
                self.store.update(job_id, |r| {
                    r.status = JobStatus::Failed;
                    r.finished_at = Some(Utc::now());
                    r.error = Some(err.to_string());
                    r.result = Some(acore_core::Verdict::fail_closed(err.to_string()));
                    r.tap_device = None;
                })
            }
        };
        self.persist(finished.as_ref());
        if let Some(record) = finished {
            info!(%job_id, status = ?record.status, tap = %tap_name, "job finished");
        }
        // `checkout` drops here, returning the TAP to the free-set.
    }

    fn finalize_failure(&self, job_id: JobId, cause: &str) {
        let record = self.store.update(job_id, |r| {
            r.status = JobStatus::Failed;
            r.finished_at = Some(Utc::now());
            r.error = Some(cause.to_string());
            r.result = Some(acore_core::Verdict::fail_closed(cause));
            r.tap_device = None;
        });
        self.persist(record.as_ref());
    }

    fn persist(&self, record: Option<&crate::job::JobRecord>) {
        if let Some(record) = record {
            if let Err(err) = self.layout.write_job_record(record) {
                warn!(job_id = %record.job_id, error = %err, "cannot persist job record");
            }
        }
    }
}
