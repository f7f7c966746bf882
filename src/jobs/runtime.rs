use super::{JobDirective, JobEnvelope, JobQueue, LeadRunJob, LeadRunJobPayload};
use crate::db::open_database;
use rusqlite::Connection;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_PAUSED_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PAUSED_MAX_ATTEMPTS: u32 = 10_000;

/// How the runtime treats each directive. Ordinary failures back off
/// exponentially; pauses wait a fixed interval with a much larger budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub paused_interval: Duration,
    pub paused_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RETRY_BASE,
            max_delay: DEFAULT_RETRY_MAX,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            paused_interval: DEFAULT_PAUSED_INTERVAL,
            paused_max_attempts: DEFAULT_PAUSED_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Finished,
    FollowUp { payload: Value },
    Retry { delay: Duration, attempt: u32 },
    Paused { delay: Duration, paused_attempts: u32 },
    Discard { reason: String },
}

impl RetryPolicy {
    /// `base * 2^(attempt-1)`, capped at `max_delay`. `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn dispose(&self, envelope: &JobEnvelope, directive: &JobDirective) -> Disposition {
        match directive {
            JobDirective::Done(result) if result.continue_run => Disposition::FollowUp {
                payload: LeadRunJobPayload::new(result.run_id, None).to_value(),
            },
            JobDirective::Done(_) => Disposition::Finished,
            JobDirective::Requeue { delay, .. } => {
                let paused_attempts = envelope.paused_attempts.saturating_add(1);
                if paused_attempts > self.paused_max_attempts {
                    Disposition::Discard {
                        reason: format!("still paused after {} requeues", self.paused_max_attempts),
                    }
                } else {
                    Disposition::Paused {
                        delay: *delay,
                        paused_attempts,
                    }
                }
            }
            JobDirective::Fail {
                reason,
                retryable: false,
            } => Disposition::Discard {
                reason: reason.clone(),
            },
            JobDirective::Fail {
                reason,
                retryable: true,
            } => {
                let attempt = envelope.attempt.saturating_add(1);
                if attempt >= self.max_attempts {
                    Disposition::Discard {
                        reason: format!("gave up after {attempt} attempts: {reason}"),
                    }
                } else {
                    Disposition::Retry {
                        delay: self.backoff(attempt),
                        attempt,
                    }
                }
            }
        }
    }
}

/// Runs lead run jobs from a queue. Every worker thread owns its own SQLite
/// connection.
pub struct WorkerPool {
    job: Arc<LeadRunJob>,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        job: Arc<LeadRunJob>,
        queue: Arc<dyn JobQueue>,
        policy: RetryPolicy,
        db_path: PathBuf,
        busy_timeout: Duration,
    ) -> Self {
        Self {
            job,
            queue,
            policy,
            db_path,
            busy_timeout,
        }
    }

    /// Runs one job and applies the retry policy to its directive.
    pub fn process(&self, connection: &mut Connection, envelope: JobEnvelope) -> Disposition {
        let directive = self.job.perform(connection, &envelope.payload);
        let disposition = self.policy.dispose(&envelope, &directive);
        match &disposition {
            Disposition::Finished => {
                debug!(job_id = envelope.id, "job finished");
            }
            Disposition::FollowUp { payload } => {
                self.queue.enqueue(payload.clone(), Duration::ZERO);
            }
            Disposition::Retry { delay, attempt } => {
                info!(job_id = envelope.id, attempt, delay_ms = delay.as_millis() as u64, "job retry scheduled");
                let mut next = envelope.clone();
                next.attempt = *attempt;
                self.queue.reschedule(next, *delay);
            }
            Disposition::Paused {
                delay,
                paused_attempts,
            } => {
                let mut next = envelope.clone();
                next.paused_attempts = *paused_attempts;
                self.queue.reschedule(next, *delay);
            }
            Disposition::Discard { reason } => {
                warn!(job_id = envelope.id, payload = %envelope.payload, reason = %reason, "job discarded");
            }
        }
        disposition
    }

    /// Processes due jobs on the calling thread until none are due or
    /// `max_jobs` have run. Returns the number processed.
    pub fn drain_due(&self, connection: &mut Connection, max_jobs: usize) -> usize {
        let mut processed = 0;
        while processed < max_jobs {
            let Some(envelope) = self.queue.take_due() else {
                break;
            };
            self.process(connection, envelope);
            processed += 1;
        }
        processed
    }

    pub fn spawn(self: &Arc<Self>, workers: usize, poll: Duration, stop: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|index| {
                let pool = Arc::clone(self);
                let stop = Arc::clone(&stop);
                thread::spawn(move || pool.worker_loop(index, poll, &stop))
            })
            .collect()
    }

    fn worker_loop(&self, index: usize, poll: Duration, stop: &AtomicBool) {
        let mut connection = match open_database(&self.db_path, self.busy_timeout) {
            Ok(connection) => connection,
            Err(err) => {
                error!(worker = index, error = %err, "worker could not open database");
                return;
            }
        };
        info!(worker = index, "worker started");
        while !stop.load(Ordering::Relaxed) {
            if let Some(envelope) = self.queue.wait_for_due(poll) {
                self.process(&mut connection, envelope);
            }
        }
        info!(worker = index, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::{Disposition, RetryPolicy, WorkerPool};
    use crate::agents::{AgentError, AgentRegistry, ScriptedAgent};
    use crate::db::{bootstrap_schema, insert_campaign, insert_lead, open_database, LeadInsert};
    use crate::executor::{ExecutorSettings, LeadRunExecutor};
    use crate::jobs::{InMemoryJobQueue, JobDirective, JobEnvelope, JobQueue, LeadRunJob, RequeueKind};
    use crate::pause::PauseSwitch;
    use crate::planner::LeadRunPlanner;
    use crate::schema::{AgentName, RunStatus};
    use crate::settings::Settings;
    use crate::store::get_run;
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open memory db");
        bootstrap_schema(&mut conn).expect("bootstrap schema");
        conn
    }

    fn seed_run(conn: &mut Connection) -> i64 {
        let campaign_id = insert_campaign(conn, "Spring", &Settings::new()).expect("campaign");
        let lead_id = insert_lead(conn, &LeadInsert { campaign_id, ..LeadInsert::default() }).expect("lead");
        LeadRunPlanner::build(conn, lead_id).expect("plan").id
    }

    fn envelope(attempt: u32, paused_attempts: u32) -> JobEnvelope {
        JobEnvelope {
            id: 1,
            payload: json!({"run_id": 1}),
            attempt,
            paused_attempts,
            available_at_ms: 0,
        }
    }

    fn pool(registry: AgentRegistry, pause: &PauseSwitch, queue: Arc<InMemoryJobQueue>) -> WorkerPool {
        let job = LeadRunJob::new(
            Arc::new(LeadRunExecutor::new(registry, ExecutorSettings::default())),
            Arc::new(pause.clone()),
            Duration::from_secs(300),
        );
        WorkerPool::new(
            Arc::new(job),
            queue,
            RetryPolicy::default(),
            PathBuf::from(":memory:"),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(3), Duration::from_secs(40));
        assert_eq!(policy.backoff(4), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn retryable_failures_back_off_until_attempts_run_out() {
        let policy = RetryPolicy::default();
        let fail = JobDirective::Fail {
            reason: "db locked".into(),
            retryable: true,
        };
        assert_eq!(
            policy.dispose(&envelope(0, 0), &fail),
            Disposition::Retry {
                delay: policy.base_delay,
                attempt: 1
            }
        );
        assert!(matches!(policy.dispose(&envelope(2, 0), &fail), Disposition::Discard { .. }));
    }

    #[test]
    fn argument_errors_are_discarded_immediately() {
        let policy = RetryPolicy::default();
        let directive = JobDirective::Fail {
            reason: "bad payload".into(),
            retryable: false,
        };
        assert_eq!(
            policy.dispose(&envelope(0, 0), &directive),
            Disposition::Discard {
                reason: "bad payload".into()
            }
        );
    }

    #[test]
    fn pauses_use_a_fixed_interval_and_their_own_budget() {
        let policy = RetryPolicy::default();
        let paused = JobDirective::Requeue {
            delay: Duration::from_secs(300),
            kind: RequeueKind::Paused,
        };
        assert_eq!(
            policy.dispose(&envelope(2, 500), &paused),
            Disposition::Paused {
                delay: Duration::from_secs(300),
                paused_attempts: 501
            }
        );
        assert!(matches!(
            policy.dispose(&envelope(0, policy.paused_max_attempts), &paused),
            Disposition::Discard { .. }
        ));
    }

    #[test]
    fn drain_runs_a_whole_pipeline_through_follow_up_jobs() {
        let mut conn = setup_conn();
        let run_id = seed_run(&mut conn);
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = pool(AgentRegistry::dry_run(), &PauseSwitch::default(), Arc::clone(&queue));

        queue.enqueue(json!({"run_id": run_id}), Duration::ZERO);
        let processed = pool.drain_due(&mut conn, 20);

        assert_eq!(processed, 4);
        assert!(queue.is_empty());
        assert_eq!(get_run(&conn, run_id).expect("run").status, RunStatus::Completed);
    }

    #[test]
    fn paused_job_is_put_back_with_delay() {
        let mut conn = setup_conn();
        let run_id = seed_run(&mut conn);
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = pool(AgentRegistry::dry_run(), &PauseSwitch::new(true), Arc::clone(&queue));

        queue.enqueue(json!({"run_id": run_id}), Duration::ZERO);
        assert_eq!(pool.drain_due(&mut conn, 20), 1);

        let waiting = queue.snapshot();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].paused_attempts, 1);
        assert_eq!(waiting[0].attempt, 0);
        assert_eq!(get_run(&conn, run_id).expect("run").status, RunStatus::Queued);
    }

    #[test]
    fn transient_failure_is_retried_later() {
        let mut conn = setup_conn();
        let run_id = seed_run(&mut conn);
        let queue = Arc::new(InMemoryJobQueue::new());
        let searcher = Arc::new(ScriptedAgent::new(vec![Err(AgentError::transient("busy"))]));
        let pool = pool(
            AgentRegistry::dry_run().with(AgentName::Search, searcher),
            &PauseSwitch::default(),
            Arc::clone(&queue),
        );

        queue.enqueue(json!({"run_id": run_id}), Duration::ZERO);
        assert_eq!(pool.drain_due(&mut conn, 20), 1);
        let waiting = queue.snapshot();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].attempt, 1);
        assert!(queue.take_due().is_none());
    }

    #[test]
    fn spawned_workers_complete_a_run_on_a_file_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("leadrun.sqlite3");
        let run_id = {
            let mut conn = open_database(&path, Duration::from_secs(5)).expect("open");
            bootstrap_schema(&mut conn).expect("bootstrap");
            seed_run(&mut conn)
        };
        let queue = Arc::new(InMemoryJobQueue::new());
        let job = LeadRunJob::new(
            Arc::new(LeadRunExecutor::new(AgentRegistry::dry_run(), ExecutorSettings::default())),
            Arc::new(PauseSwitch::default()),
            Duration::from_secs(300),
        );
        let pool = Arc::new(WorkerPool::new(
            Arc::new(job),
            queue.clone(),
            RetryPolicy::default(),
            path.clone(),
            Duration::from_secs(5),
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let handles = pool.spawn(2, Duration::from_millis(20), Arc::clone(&stop));

        queue.enqueue(json!({"run_id": run_id}), Duration::ZERO);
        let conn = open_database(&path, Duration::from_secs(5)).expect("open");
        let mut status = RunStatus::Queued;
        for _ in 0..250 {
            status = get_run(&conn, run_id).expect("run").status;
            if status.is_terminal() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for handle in handles {
            handle.join().expect("join worker");
        }
        assert_eq!(status, RunStatus::Completed);
    }
}
