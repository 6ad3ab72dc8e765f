use crate::config::{self, Config};
use crate::data::ProblemStore;
use crate::exec::Executor;
use crate::lang::Language;
use crate::registry::Registry;
use crate::verdict;

use obi_protocol::common::{Language as Lang, Outcome, Submission, SubmissionId, Verdict, VerdictStatus};
use obi_utils::retry::calculate_backoff;

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("language {0} is not supported")]
    UnsupportedLanguage(Lang),

    #[error("problem {0} does not exist")]
    UnknownProblem(String),

    #[error("submission {0} already exists")]
    Duplicate(SubmissionId),

    #[error("judge engine is stopped")]
    Stopped,
}

/// Owns the submission queue, the verdict map and the worker pool.
pub struct JudgeEngine {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    queue: Mutex<QueueState>,
    queue_cond: Condvar,
    verdicts: DashMap<SubmissionId, Entry>,
    registry: Registry,
    store: Arc<dyn ProblemStore>,
    executor: Executor,
    config: config::Engine,
    last_sweep: Mutex<Instant>,
}

struct QueueState {
    pending: VecDeque<Submission>,
    accepting: bool,
    stopping: bool,
}

struct Entry {
    verdict: Verdict,
    cancel: Arc<AtomicBool>,
}

impl JudgeEngine {
    pub fn new(config: &Config, registry: Registry, store: Arc<dyn ProblemStore>) -> Result<Self> {
        let executor = Executor::new(config).context("failed to create executor")?;
        let inner = Inner {
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                accepting: true,
                stopping: false,
            }),
            queue_cond: Condvar::new(),
            verdicts: DashMap::new(),
            registry,
            store,
            executor,
            config: config.engine.clone(),
            last_sweep: Mutex::new(Instant::now()),
        };
        Ok(Self {
            inner: Arc::new(inner),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn ProblemStore> {
        &self.inner.store
    }

    /// Launches `num_workers` worker threads.
    pub fn start(&self, num_workers: usize) -> Result<()> {
        let mut workers = lock(&self.workers);
        let base = workers.len();
        for i in base..base + num_workers {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("obi-worker-{}", i))
                .spawn(move || inner.worker_loop(i))
                .context("failed to spawn worker")?;
            workers.push(handle);
        }
        info!(num_workers, "judge workers started");
        Ok(())
    }

    /// Appends a submission to the queue. Never blocks on judging.
    pub fn enqueue(&self, submission: Submission) -> Result<SubmissionId, EnqueueError> {
        let id = submission.id;
        let inner = &*self.inner;
        inner.evict_expired();

        if !inner.registry.contains(submission.language) {
            // recorded so that a later lookup still finds a terminal verdict
            inner.verdicts.entry(id).or_insert_with(|| Entry {
                verdict: Verdict::new(VerdictStatus::InternalError),
                cancel: Arc::new(AtomicBool::new(false)),
            });
            warn!(submission_id = %id, language = %submission.language, "unsupported language");
            return Err(EnqueueError::UnsupportedLanguage(submission.language));
        }

        match inner.store.problem(&submission.problem_id) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(EnqueueError::UnknownProblem(submission.problem_id)),
            Err(err) => {
                error!(?err, "failed to look up problem");
                return Err(EnqueueError::UnknownProblem(submission.problem_id));
            }
        }

        let mut queue = lock(&inner.queue);
        if !queue.accepting {
            return Err(EnqueueError::Stopped);
        }
        if inner.verdicts.contains_key(&id) {
            return Err(EnqueueError::Duplicate(id));
        }
        inner.insert_verdict(id, Verdict::new(VerdictStatus::Queued));
        queue.pending.push_back(submission);
        drop(queue);

        inner.queue_cond.notify_one();
        debug!(submission_id = %id, "enqueued");
        Ok(id)
    }

    pub fn status(&self, id: SubmissionId) -> Option<Verdict> {
        self.inner.verdicts.get(&id).map(|e| e.verdict.clone())
    }

    /// Cancels a submission. A queued one is removed and marked CANCELLED at
    /// once; a judging one stops after its current test case.
    pub fn cancel(&self, id: SubmissionId) -> Option<Verdict> {
        let inner = &*self.inner;
        {
            let mut queue = lock(&inner.queue);
            if let Some(pos) = queue.pending.iter().position(|s| s.id == id) {
                queue.pending.remove(pos);
                inner.transition(id, Verdict::new(VerdictStatus::Cancelled));
                info!(submission_id = %id, "cancelled while queued");
            } else if let Some(entry) = inner.verdicts.get(&id) {
                if entry.verdict.status == VerdictStatus::Judging {
                    entry.cancel.store(true, Ordering::SeqCst);
                    info!(submission_id = %id, "cancel requested while judging");
                }
            }
        }
        self.status(id)
    }

    /// A clone of a submission still waiting for a worker.
    pub fn pending(&self, id: SubmissionId) -> Option<Submission> {
        let queue = lock(&self.inner.queue);
        queue.pending.iter().find(|s| s.id == id).cloned()
    }

    /// Ids still waiting for a worker, in arrival order.
    pub fn queued(&self) -> Vec<SubmissionId> {
        lock(&self.inner.queue).pending.iter().map(|s| s.id).collect()
    }

    /// Stops accepting submissions, cancels queued ones and waits for every
    /// worker to finish its current submission.
    pub fn stop(&self) {
        let inner = &*self.inner;
        {
            let mut queue = lock(&inner.queue);
            queue.accepting = false;
            queue.stopping = true;
            for submission in queue.pending.drain(..) {
                inner.transition(submission.id, Verdict::new(VerdictStatus::Cancelled));
            }
        }
        inner.queue_cond.notify_all();

        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        let count = workers.len();
        for handle in workers {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!(count, "judge workers stopped");
    }
}

impl Drop for JudgeEngine {
    fn drop(&mut self) {
        let has_workers = !lock(&self.workers).is_empty();
        if has_workers {
            self.stop();
        }
    }
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // judging never runs under these locks
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn insert_verdict(&self, id: SubmissionId, verdict: Verdict) {
        let entry = Entry {
            verdict,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        self.verdicts.insert(id, entry);
    }

    /// Drops final verdicts past the retention period. Runs at most once per
    /// sweep interval.
    fn evict_expired(&self) {
        let retention = Duration::from_secs(self.config.retention_secs);
        {
            let mut last_sweep = lock(&self.last_sweep);
            if last_sweep.elapsed() < retention.min(SWEEP_INTERVAL) {
                return;
            }
            *last_sweep = Instant::now();
        }

        let cutoff = match chrono::Duration::from_std(retention) {
            Ok(retention) => Utc::now() - retention,
            Err(_) => return,
        };
        let before = self.verdicts.len();
        self.verdicts.retain(|_, entry| {
            !(entry.verdict.status.is_final() && entry.verdict.updated_at <= cutoff)
        });
        let evicted = before.saturating_sub(self.verdicts.len());
        if evicted > 0 {
            debug!(evicted, "expired verdicts evicted");
        }
    }

    /// Moves a verdict forward. Regressions are dropped.
    fn transition(&self, id: SubmissionId, verdict: Verdict) -> bool {
        match self.verdicts.get_mut(&id) {
            Some(mut entry) => {
                let from = entry.verdict.status;
                if from.can_transition_to(verdict.status) {
                    entry.verdict = verdict;
                    true
                } else {
                    warn!(submission_id = %id, %from, to = %verdict.status, "verdict transition rejected");
                    false
                }
            }
            None => false,
        }
    }

    fn next_submission(&self) -> Option<(Submission, Arc<AtomicBool>)> {
        let mut queue = lock(&self.queue);
        loop {
            if queue.stopping {
                return None;
            }
            if let Some(submission) = queue.pending.pop_front() {
                // marked while the queue is locked so cancel never races it
                self.transition(submission.id, Verdict::new(VerdictStatus::Judging));
                let cancel = match self.verdicts.get(&submission.id) {
                    Some(entry) => Arc::clone(&entry.cancel),
                    None => Arc::new(AtomicBool::new(false)),
                };
                return Some((submission, cancel));
            }
            queue = self
                .queue_cond
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn worker_loop(&self, idx: usize) {
        debug!(worker = idx, "worker started");
        while let Some((submission, cancel)) = self.next_submission() {
            let id = submission.id;
            let span = tracing::info_span!("judge", submission_id = %id, language = %submission.language);
            let _enter = span.enter();

            let result =
                panic::catch_unwind(AssertUnwindSafe(|| self.judge_with_retry(&submission, &cancel)));

            let mut verdict = match result {
                Ok(v) => v,
                Err(_) => {
                    error!("judging panicked");
                    Verdict::new(VerdictStatus::InternalError)
                }
            };
            verdict.updated_at = Utc::now();

            info!(status = %verdict.status, failed_case = ?verdict.failed_case, "judged");
            self.transition(id, verdict);
        }
        debug!(worker = idx, "worker exited");
    }

    fn judge_with_retry(&self, submission: &Submission, cancel: &AtomicBool) -> Verdict {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.judge(submission, cancel) {
                Ok(verdict) => return verdict,
                Err(err) => {
                    warn!(attempt, ?err, "judging attempt failed");
                    if attempt < max_attempts {
                        let delay = calculate_backoff(
                            attempt,
                            self.config.base_delay_ms,
                            self.config.max_delay_ms,
                        );
                        thread::sleep(delay);
                    }
                }
            }
        }
        error!(max_attempts, "judging attempts exhausted");
        Verdict::new(VerdictStatus::InternalError)
    }

    /// One judging attempt. `Err` is an internal fault and may be retried.
    fn judge(&self, submission: &Submission, cancel: &AtomicBool) -> Result<Verdict> {
        let adapter: &dyn Language = &**self
            .registry
            .get(submission.language)
            .with_context(|| format!("no adapter for {}", submission.language))?;

        let problem = self
            .store
            .problem(&submission.problem_id)?
            .with_context(|| format!("problem {} disappeared", submission.problem_id))?;

        let work = self.executor.create_workspace(submission.id)?;

        let compiled = self.executor.compile(&work, adapter, &submission.source)?;
        let expected: Vec<Vec<u8>> = problem.tests.iter().map(|t| t.output.clone()).collect();
        if compiled.outcome != Outcome::Ok {
            return Ok(verdict::fold(&[compiled], &expected));
        }

        let mut results = Vec::with_capacity(problem.tests.len());
        for test_case in &problem.tests {
            if cancel.load(Ordering::SeqCst) {
                info!(case = test_case.position, "abandoned after cancel");
                return Ok(Verdict::new(VerdictStatus::Cancelled));
            }

            let result = self
                .executor
                .run_one_test_case(&work, submission, test_case, adapter);

            if result.outcome == Outcome::InternalError {
                anyhow::bail!("test case {}: {}", test_case.position, result.stderr);
            }

            let failed = verdict::judge_case(&result, &test_case.output);
            debug!(case = test_case.position, outcome = ?result.outcome, ?failed, "test case done");
            results.push(result);

            self.report_progress(submission.id, results.len());

            if failed.is_some() {
                break;
            }
        }

        Ok(verdict::fold(&results, &expected))
    }

    fn report_progress(&self, id: SubmissionId, cases_run: usize) {
        if let Some(mut entry) = self.verdicts.get_mut(&id) {
            if entry.verdict.status == VerdictStatus::Judging {
                entry.verdict.cases_run = cases_run;
                entry.verdict.updated_at = Utc::now();
            }
        }
    }
}
