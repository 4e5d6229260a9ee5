//! Worker pool
//!
//! A worker process runs N slots (tokio tasks) of one worker class. Each
//! slot loops: snapshot config, tick the scheduler, claim a job whose type
//! still has capacity, run its handler with a lease-renewal task alongside,
//! then settle the row according to the error taxonomy.

pub mod handlers;

pub use handlers::{build_registry, HandlerRegistry, JobContext, JobHandler, WorkerClass};

use rand::Rng;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sv_common::db::settings::{get_setting, set_setting};
use sv_common::models::Job;
use sv_common::params::{load_runtime_config, RuntimeConfig};
use sv_common::time::{now_iso, parse_iso};
use sv_common::{Error, ErrorKind, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::db::sources;
use crate::queue::{self, job_types, EnqueueOptions};

/// In-process per-type concurrency bookkeeping.
///
/// A slot refuses to claim a job type already at its cap in this process;
/// low caps on `summarize_article_llm` are what keep provider spend sane.
#[derive(Default)]
pub struct TypeGate {
    in_flight: Mutex<HashMap<String, usize>>,
}

impl TypeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subset of `candidates` whose in-flight count is below its cap.
    pub fn admissible<'a>(
        &self,
        candidates: &[&'a str],
        caps: &std::collections::BTreeMap<String, usize>,
    ) -> Vec<&'a str> {
        let in_flight = self.in_flight.lock().expect("gate poisoned");
        candidates
            .iter()
            .filter(|job_type| {
                let current = in_flight.get(**job_type).copied().unwrap_or(0);
                let cap = caps.get(**job_type).copied().unwrap_or(usize::MAX);
                current < cap
            })
            .copied()
            .collect()
    }

    pub fn note_started(&self, job_type: &str) {
        let mut in_flight = self.in_flight.lock().expect("gate poisoned");
        *in_flight.entry(job_type.to_string()).or_insert(0) += 1;
    }

    pub fn note_finished(&self, job_type: &str) {
        let mut in_flight = self.in_flight.lock().expect("gate poisoned");
        if let Some(count) = in_flight.get_mut(job_type) {
            *count = count.saturating_sub(1);
        }
    }
}

/// One worker process: a claim loop fanned out over N slots.
pub struct WorkerPool {
    pool: SqlitePool,
    class: WorkerClass,
    worker_id: String,
    slots: usize,
    registry: Arc<HandlerRegistry>,
    gate: Arc<TypeGate>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(pool: SqlitePool, class: WorkerClass, worker_id: String, slots: usize) -> Self {
        Self {
            pool,
            class,
            worker_id,
            slots: slots.max(1),
            registry: Arc::new(build_registry(class)),
            gate: Arc::new(TypeGate::new()),
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Run until the process is killed (or, with `once`, until each slot has
    /// drained the queue of claimable work).
    pub async fn run(&self, once: bool) -> Result<()> {
        info!(
            class = self.class.as_str(),
            worker_id = %self.worker_id,
            slots = self.slots,
            "worker pool starting"
        );
        let mut tasks = Vec::with_capacity(self.slots);
        for slot in 0..self.slots {
            let pool = self.pool.clone();
            let registry = Arc::clone(&self.registry);
            let gate = Arc::clone(&self.gate);
            let class = self.class;
            let worker_id = format!("{}#{}", self.worker_id, slot);
            let poll_interval = self.poll_interval;
            tasks.push(tokio::spawn(async move {
                slot_loop(pool, class, worker_id, registry, gate, poll_interval, once).await
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("worker slot panicked: {e}");
            }
        }
        Ok(())
    }
}

async fn slot_loop(
    pool: SqlitePool,
    class: WorkerClass,
    worker_id: String,
    registry: Arc<HandlerRegistry>,
    gate: Arc<TypeGate>,
    poll_interval: Duration,
    once: bool,
) {
    loop {
        let config = match load_runtime_config(&pool).await {
            Ok(config) => config,
            Err(e) => {
                error!("config snapshot failed: {e}");
                if once {
                    return;
                }
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        if class == WorkerClass::Fetch {
            if let Err(e) = scheduler_tick(&pool, &config).await {
                warn!("scheduler tick failed: {e}");
            }
        }

        let allowed = gate.admissible(class.job_types(), &config.jobs.type_caps);
        let claimed = match queue::claim_next_job(
            &pool,
            &worker_id,
            &allowed,
            config.jobs.lease_ttl_seconds,
        )
        .await
        {
            Ok(job) => job,
            Err(e) => {
                // Claim contention surfaces as a transient error; retry after
                // short jitter rather than crashing the slot.
                if e.kind() == ErrorKind::Transient {
                    let jitter = rand::thread_rng().gen_range(50..250);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    continue;
                }
                error!("claim failed: {e}");
                None
            }
        };

        match claimed {
            Some(job) => {
                gate.note_started(&job.job_type);
                let job_type = job.job_type.clone();
                process_job(&pool, &config, &registry, &worker_id, job).await;
                gate.note_finished(&job_type);
                if once {
                    continue; // drain remaining claimable work, then exit below
                }
            }
            None => {
                if once {
                    return;
                }
                let jitter = rand::thread_rng().gen_range(0..500);
                tokio::time::sleep(poll_interval + Duration::from_millis(jitter)).await;
            }
        }
    }
}

/// Run one claimed job to a terminal (or requeued) state.
async fn process_job(
    pool: &SqlitePool,
    config: &RuntimeConfig,
    registry: &HandlerRegistry,
    worker_id: &str,
    job: Job,
) {
    info!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "job claimed");

    let handler = match registry.get(&job.job_type) {
        Some(handler) => handler,
        None => {
            let _ = queue::fail_job(
                pool,
                &job.id,
                &format!("internal: no handler for job type {}", job.job_type),
                None,
            )
            .await;
            return;
        }
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let renewal = spawn_lease_renewal(
        pool.clone(),
        job.id.clone(),
        worker_id.to_string(),
        config.jobs.lease_ttl_seconds,
        cancel_tx,
    );

    let ctx = JobContext {
        pool: pool.clone(),
        config: config.clone(),
        job: job.clone(),
        cancel: cancel_rx,
    };

    let hard_timeout = config
        .jobs
        .hard_timeout_seconds
        .get(&job.job_type)
        .copied()
        .map(|secs| Duration::from_secs(secs.max(1) as u64));
    let outcome = match hard_timeout {
        Some(limit) => match tokio::time::timeout(limit, handler.run(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Canceled),
        },
        None => handler.run(&ctx).await,
    };

    renewal.abort();
    settle(pool, config, &job, outcome).await;
}

/// Record a handler outcome on the job row per the error taxonomy.
async fn settle(
    pool: &SqlitePool,
    config: &RuntimeConfig,
    job: &Job,
    outcome: Result<serde_json::Value>,
) {
    match outcome {
        Ok(result) => {
            let canceled = queue::is_cancel_requested(pool, &job.id)
                .await
                .unwrap_or(false);
            if canceled {
                let _ = queue::mark_canceled(pool, &job.id).await;
                info!(job_id = %job.id, "job canceled");
                return;
            }
            match queue::complete_job(pool, &job.id, Some(&result)).await {
                Ok(true) => info!(job_id = %job.id, job_type = %job.job_type, "job succeeded"),
                Ok(false) => warn!(job_id = %job.id, "job completion raced a lease takeover"),
                Err(e) => error!(job_id = %job.id, "job completion failed: {e}"),
            }
        }
        Err(err) => {
            let kind = err.kind();
            if kind == ErrorKind::Canceled {
                let _ = queue::mark_canceled(pool, &job.id).await;
                info!(job_id = %job.id, "job canceled");
                return;
            }
            if kind.is_retryable() && job.attempts < job.max_attempts {
                let base = if kind == ErrorKind::RateLimited {
                    config.jobs.rate_limited_base_seconds
                } else {
                    config.jobs.retry_base_seconds
                };
                let retry_after = match &err {
                    Error::RateLimited {
                        retry_after_seconds,
                        ..
                    } => *retry_after_seconds,
                    _ => None,
                };
                match queue::requeue_with_backoff(
                    pool,
                    job,
                    base,
                    config.jobs.retry_cap_seconds,
                    retry_after,
                )
                .await
                {
                    Ok(run_after) => info!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempt = job.attempts,
                        run_after = %run_after,
                        "job requeued: {err}"
                    ),
                    Err(e) => error!(job_id = %job.id, "requeue failed: {e}"),
                }
                return;
            }
            let message = format!("{}: {}", kind.as_str(), truncate(&err.to_string(), 4096));
            match queue::fail_job(pool, &job.id, &message, None).await {
                Ok(_) => error!(job_id = %job.id, job_type = %job.job_type, "job failed: {err}"),
                Err(e) => error!(job_id = %job.id, "failure recording failed: {e}"),
            }
        }
    }
}

/// Renew the lease at ttl/3 and relay cancel intents to the handler.
///
/// Runs on its own task so it survives long handler suspensions. Losing the
/// lease (another worker reclaimed the row) also raises the cancel signal.
fn spawn_lease_renewal(
    pool: SqlitePool,
    job_id: String,
    worker_id: String,
    lease_ttl_seconds: i64,
    cancel_tx: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs((lease_ttl_seconds.max(3) / 3) as u64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            match queue::is_cancel_requested(&pool, &job_id).await {
                Ok(true) => {
                    let _ = cancel_tx.send(true);
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, "cancel poll failed: {e}"),
            }
            match queue::renew_lease(&pool, &job_id, &worker_id, lease_ttl_seconds).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job_id = %job_id, "lease lost; signaling cancel");
                    let _ = cancel_tx.send(true);
                    return;
                }
                Err(e) => warn!(job_id = %job_id, "lease renewal failed: {e}"),
            }
        }
    })
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Opportunistic scheduler: enqueue `ingest_due_sources` and `cve_sync` when
/// they are due. Both enqueues are debounced so many slots ticking at once
/// still produce one job.
pub async fn scheduler_tick(pool: &SqlitePool, config: &RuntimeConfig) -> Result<()> {
    maybe_enqueue_ingest_due(pool, config).await?;
    maybe_enqueue_cve_sync(pool, config).await?;
    Ok(())
}

async fn maybe_enqueue_ingest_due(pool: &SqlitePool, config: &RuntimeConfig) -> Result<()> {
    if queue::has_pending_job(pool, job_types::INGEST_DUE_SOURCES, None).await? {
        return Ok(());
    }
    let now = now_iso();
    if let Some(last) = get_setting::<String>(pool, "ingest_due.last_enqueued_at").await? {
        if let (Some(last_dt), Some(now_dt)) = (parse_iso(&last), parse_iso(&now)) {
            if (now_dt - last_dt).num_seconds() < config.jobs.ingest_due_debounce_seconds {
                return Ok(());
            }
        }
    }
    let due = sources::list_due_sources(pool, &now).await?;
    if due.is_empty() {
        return Ok(());
    }
    queue::enqueue_job(
        pool,
        job_types::INGEST_DUE_SOURCES,
        None,
        EnqueueOptions {
            debounce: true,
            ..Default::default()
        },
    )
    .await?;
    set_setting(pool, "ingest_due.last_enqueued_at", &now).await?;
    info!(due_count = due.len(), "ingest_due_sources enqueued");
    Ok(())
}

async fn maybe_enqueue_cve_sync(pool: &SqlitePool, config: &RuntimeConfig) -> Result<()> {
    if !config.cve.enabled {
        return Ok(());
    }
    let now = chrono::Utc::now();
    let due = match get_setting::<String>(pool, "cve.last_successful_sync_at").await? {
        Some(last) => match parse_iso(&last) {
            Some(last_dt) => {
                (now - last_dt).num_minutes() >= config.cve.schedule_minutes
            }
            None => true,
        },
        None => true,
    };
    if due {
        queue::enqueue_job(
            pool,
            job_types::CVE_SYNC,
            None,
            EnqueueOptions {
                debounce: true,
                ..Default::default()
            },
        )
        .await?;
    }
    Ok(())
}
