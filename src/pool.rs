//! Admission control for concurrent encodes, and the bookkeeping shared between the workers and
//! the progress reporter.

use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::{
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::InputFile;
use crate::{job_info, job_warn};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Processes one admitted input file. An `Err` marks the job as failed; it does not stop the
/// batch.
#[allow(async_fn_in_trait)]
pub trait Worker {
    async fn process(&self, input: &InputFile) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// The output already existed.
    Skipped,
    Failed(String),
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct JobReport {
    pub path: PathBuf,
    pub outcome: JobOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub completed: usize,
    pub total: usize,
    pub active: usize,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} done, {} encoding",
            self.completed, self.total, self.active
        )
    }
}

/// Counters for one batch. `completed <= total` and `active <= max_active` always hold.
#[derive(Debug)]
pub struct PoolState {
    max_active: usize,
    total: usize,
    active: AtomicUsize,
    completed: AtomicUsize,
    peak_active: AtomicUsize,
}

impl PoolState {
    pub fn new(max_active: usize, total: usize) -> Self {
        Self {
            max_active,
            total,
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        // completed first: a worker bumps it before leaving the active set
        let completed = self.completed.load(Ordering::SeqCst);
        let active = self.active.load(Ordering::SeqCst);
        Snapshot {
            completed,
            total: self.total,
            active,
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// The most workers that were ever active at once.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn admit(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(now <= self.max_active, "admitted past the pool limit");
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Account for a job that never ran (skipped or cancelled).
    fn settle(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct BatchSummary {
    pub reports: Vec<JobReport>,
    /// The progress reporter's last observation.
    pub final_snapshot: Snapshot,
}

impl BatchSummary {
    fn count(&self, pred: impl Fn(&JobOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| *o == JobOutcome::Succeeded)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| *o == JobOutcome::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| *o == JobOutcome::Cancelled)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&PathBuf, &str)> {
        self.reports.iter().filter_map(|r| match &r.outcome {
            JobOutcome::Failed(msg) => Some((&r.path, msg.as_str())),
            _ => None,
        })
    }

    pub fn outcome_of(&self, path: &std::path::Path) -> Option<&JobOutcome> {
        self.reports
            .iter()
            .find(|r| r.path == path)
            .map(|r| &r.outcome)
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded(),
            self.failed(),
            self.skipped()
        )?;
        if self.cancelled() > 0 {
            write!(f, ", {} cancelled", self.cancelled())?;
        }
        Ok(())
    }
}

/// Runs a batch of input files with at most `max_active` of them in flight at once.
pub struct Pool {
    state: Arc<PoolState>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    delete_sources: bool,
    progress_interval: Duration,
}

impl Pool {
    pub fn new(max_active: usize, total: usize, cancel: CancellationToken) -> Result<Pool> {
        if max_active == 0 {
            bail!("Cannot run with 0 jobs.");
        }
        Ok(Pool {
            state: Arc::new(PoolState::new(max_active, total)),
            permits: Arc::new(Semaphore::new(max_active)),
            cancel,
            delete_sources: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        })
    }

    /// Remove each source file after its job succeeds.
    pub fn delete_sources(mut self, delete: bool) -> Self {
        self.delete_sources = delete;
        self
    }

    pub fn progress_interval(mut self, every: Duration) -> Self {
        self.progress_interval = every;
        self
    }

    pub fn state(&self) -> Arc<PoolState> {
        self.state.clone()
    }

    /// Process every input exactly once and wait for all of them, reporting progress meanwhile.
    pub async fn run<W: Worker>(&self, inputs: &[InputFile], worker: &W) -> Result<BatchSummary> {
        if inputs.len() != self.state.total {
            bail!(
                "Pool was sized for {} jobs but given {}",
                self.state.total,
                inputs.len()
            );
        }
        let joined = CancellationToken::new();
        let work = async {
            let reports = self.admit_all(inputs, worker).await;
            joined.cancel();
            reports
        };
        let reporter = report_progress(self.state.clone(), self.progress_interval, joined.clone());
        let (reports, final_snapshot) = tokio::join!(work, reporter);
        Ok(BatchSummary {
            reports: reports?,
            final_snapshot,
        })
    }

    async fn admit_all<W: Worker>(&self, inputs: &[InputFile], worker: &W) -> Result<Vec<JobReport>> {
        let mut reports = Vec::with_capacity(inputs.len());
        let mut running = FuturesUnordered::new();

        for input in inputs {
            if self.cancel.is_cancelled() {
                reports.push(self.settle(input, JobOutcome::Cancelled));
                continue;
            }
            if input.output_blocked() {
                job_info!(
                    input,
                    "Output already exists, skipping: {:?}",
                    input.output_path
                );
                reports.push(self.settle(input, JobOutcome::Skipped));
                continue;
            }

            // Wait for a free slot, letting the running jobs make progress meanwhile.
            let permit = loop {
                select! {
                    biased;
                    _ = self.cancel.cancelled() => break None,
                    Some(report) = running.next(), if !running.is_empty() => {
                        reports.push(report);
                    }
                    permit = self.permits.clone().acquire_owned() => break Some(permit?),
                }
            };
            let Some(permit) = permit else {
                log::info!("Cancelled, no more jobs will be started");
                reports.push(self.settle(input, JobOutcome::Cancelled));
                continue;
            };

            self.state.admit();
            log::trace!("Admitted {:?} ({})", input.path, self.state.snapshot());
            running.push(self.run_one(input, worker, permit));
        }

        log::trace!("All jobs admitted, waiting for the rest to finish");
        while let Some(report) = running.next().await {
            reports.push(report);
        }
        Ok(reports)
    }

    async fn run_one<'a, W: Worker>(
        &'a self,
        input: &'a InputFile,
        worker: &'a W,
        permit: OwnedSemaphorePermit,
    ) -> JobReport {
        let outcome = match worker.process(input).await {
            Ok(()) => JobOutcome::Succeeded,
            Err(_) if self.cancel.is_cancelled() => JobOutcome::Cancelled,
            Err(err) => {
                // This is significant enough to show right away, not just at the end:
                job_warn!(input, "{:?}: {:#}", input.path, err);
                JobOutcome::Failed(format!("{err:#}"))
            }
        };

        if outcome == JobOutcome::Succeeded && self.delete_sources {
            job_info!(input, "Deleting source file {:?}", input.path);
            if let Err(err) = tokio::fs::remove_file(&input.path).await {
                job_warn!(input, "Could not delete source file {:?}: {}", input.path, err);
            }
        }

        self.state.finish();
        drop(permit);
        JobReport {
            path: input.path.clone(),
            outcome,
        }
    }

    fn settle(&self, input: &InputFile, outcome: JobOutcome) -> JobReport {
        self.state.settle();
        JobReport {
            path: input.path.clone(),
            outcome,
        }
    }
}

/// Log progress every `every` until all jobs are accounted for or `joined` fires. Returns the
/// last observation, taken after the loop ends.
pub async fn report_progress(
    state: Arc<PoolState>,
    every: Duration,
    joined: CancellationToken,
) -> Snapshot {
    // interval() panics on a zero period
    let mut ticker = interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate; nothing has happened yet.
    ticker.tick().await;

    loop {
        select! {
            _ = joined.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = state.snapshot();
                if snapshot.completed == snapshot.total {
                    break;
                }
                log::info!("Progress: {snapshot}");
            }
        }
    }

    let last = state.snapshot();
    log::info!("Progress: {last}");
    last
}
