use crate::clock::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// A queued job with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: u64,
    pub payload: Value,
    /// Ordinary failed attempts so far.
    pub attempt: u32,
    /// Times the job was put back because execution was paused.
    pub paused_attempts: u32,
    pub available_at_ms: i64,
}

/// At-least-once job queue. Jobs become visible once `available_at_ms`
/// has passed.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, payload: Value, delay: Duration) -> u64;

    /// Puts a previously taken envelope back with updated counters.
    fn reschedule(&self, envelope: JobEnvelope, delay: Duration);

    /// Takes the oldest due job, if any.
    fn take_due(&self) -> Option<JobEnvelope>;

    /// Blocks up to `timeout` for a job to become due.
    fn wait_for_due(&self, timeout: Duration) -> Option<JobEnvelope>;

    fn len(&self) -> usize;

    /// True when a waiting (not yet taken) job's payload satisfies `matches`.
    fn any_pending(&self, matches: &dyn Fn(&Value) -> bool) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    jobs: VecDeque<JobEnvelope>,
}

/// Process-local queue used by the worker daemon and tests.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<JobEnvelope> {
        self.lock().jobs.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, mut envelope: JobEnvelope, delay: Duration) {
        envelope.available_at_ms = now_ms().saturating_add(delay.as_millis() as i64);
        self.lock().jobs.push_back(envelope);
        self.ready.notify_one();
    }

    fn take_due_locked(state: &mut QueueState, now: i64) -> Option<JobEnvelope> {
        let index = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.available_at_ms <= now)
            .min_by_key(|(_, job)| (job.available_at_ms, job.id))
            .map(|(index, _)| index)?;
        state.jobs.remove(index)
    }

    fn next_due_in(state: &QueueState, now: i64) -> Option<Duration> {
        state
            .jobs
            .iter()
            .map(|job| job.available_at_ms)
            .min()
            .map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64))
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, payload: Value, delay: Duration) -> u64 {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            state.next_id
        };
        self.push(
            JobEnvelope {
                id,
                payload,
                attempt: 0,
                paused_attempts: 0,
                available_at_ms: 0,
            },
            delay,
        );
        id
    }

    fn reschedule(&self, envelope: JobEnvelope, delay: Duration) {
        self.push(envelope, delay);
    }

    fn take_due(&self) -> Option<JobEnvelope> {
        let mut state = self.lock();
        Self::take_due_locked(&mut state, now_ms())
    }

    fn wait_for_due(&self, timeout: Duration) -> Option<JobEnvelope> {
        let deadline = now_ms().saturating_add(timeout.as_millis() as i64);
        let mut state = self.lock();
        loop {
            let now = now_ms();
            if let Some(job) = Self::take_due_locked(&mut state, now) {
                return Some(job);
            }
            if now >= deadline {
                return None;
            }
            let until_deadline = Duration::from_millis((deadline - now) as u64);
            let wait = Self::next_due_in(&state, now)
                .map(|due| due.min(until_deadline))
                .unwrap_or(until_deadline);
            state = match self.ready.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    fn any_pending(&self, matches: &dyn Fn(&Value) -> bool) -> bool {
        self.lock().jobs.iter().any(|job| matches(&job.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryJobQueue, JobQueue};
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn due_jobs_come_out_in_enqueue_order() {
        let queue = InMemoryJobQueue::new();
        let first = queue.enqueue(json!({"run_id": 1}), Duration::ZERO);
        let second = queue.enqueue(json!({"run_id": 2}), Duration::ZERO);
        assert_eq!(queue.take_due().map(|job| job.id), Some(first));
        assert_eq!(queue.take_due().map(|job| job.id), Some(second));
        assert!(queue.take_due().is_none());
    }

    #[test]
    fn delayed_jobs_stay_hidden_until_due() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(json!({"run_id": 1}), Duration::from_secs(60));
        assert!(queue.take_due().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rescheduled_envelope_keeps_its_counters() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(json!({"run_id": 1}), Duration::ZERO);
        let mut job = queue.take_due().expect("job");
        job.attempt = 2;
        job.paused_attempts = 1;
        queue.reschedule(job.clone(), Duration::ZERO);
        let again = queue.take_due().expect("rescheduled");
        assert_eq!((again.id, again.attempt, again.paused_attempts), (job.id, 2, 1));
    }

    #[test]
    fn waiting_consumer_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_for_due(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        queue.enqueue(json!({"run_id": 9}), Duration::ZERO);
        let job = consumer.join().expect("join").expect("job delivered");
        assert_eq!(job.payload, json!({"run_id": 9}));
    }

    #[test]
    fn pending_jobs_can_be_matched_by_payload() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(json!({"run_id": 3}), Duration::from_secs(60));
        assert!(queue.any_pending(&|payload| payload["run_id"] == json!(3)));
        assert!(!queue.any_pending(&|payload| payload["run_id"] == json!(4)));
    }

    #[test]
    fn wait_times_out_when_nothing_is_due() {
        let queue = InMemoryJobQueue::new();
        assert!(queue.wait_for_due(Duration::from_millis(20)).is_none());
    }
}
