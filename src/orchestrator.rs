//! Fan-out of one comparison run: writer first, then one fetcher per shard,
//! then drain and writer shutdown.

use crate::concurrency::{resolve_from_environment, FetcherBudget};
use crate::config::{RunConfig, Settings, SourceSpec};
use crate::launcher::{ChildEvent, ChildHandle, Launcher};
use crate::layout::{wait_for_drain, RunLayout};
use crate::plan::{plan_jobs, FetchJob, ShardPlan};
use crate::progress::ProgressTracker;
use crate::protocol::{ChildMessage, FetcherPayload};
use crate::{ExtractError, FetcherFailure};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub ready_timeout: Duration,
    pub drain_poll_interval: Duration,
    pub drain_timeout: Duration,
    pub writer_grace: Duration,
    /// How long to block on child events before rechecking exit status.
    pub event_poll: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            drain_poll_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(60),
            writer_grace: Duration::from_secs(1),
            event_poll: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub fetcher_count: usize,
    pub org_count: usize,
    pub object_count: usize,
    pub process_per_org: usize,
    pub data_dir: PathBuf,
    pub total_records: usize,
    /// Exit code of the buffer writer; `None` when it had to be killed.
    pub writer_exit: Option<i32>,
}

struct FetcherSlot {
    job: FetchJob,
    handle: Box<dyn ChildHandle>,
    exit: Option<Option<i32>>,
}

/// Every spawned child, killed on drop unless the run completed normally.
#[derive(Default)]
struct ChildSet {
    writer: Option<Box<dyn ChildHandle>>,
    fetchers: Vec<FetcherSlot>,
    disarmed: bool,
}

impl ChildSet {
    fn kill_all(&mut self) {
        for slot in &mut self.fetchers {
            if slot.exit.is_none() {
                warn!(fetcher = slot.handle.label(), "killing fetcher");
                slot.handle.kill();
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            if !matches!(writer.try_wait(), Ok(Some(_))) {
                warn!("killing buffer writer");
            }
            writer.kill();
        }
    }
}

impl Drop for ChildSet {
    fn drop(&mut self) {
        if !self.disarmed {
            self.kill_all();
        }
    }
}

pub struct FetchOrchestrator<L: Launcher> {
    launcher: L,
    options: OrchestratorOptions,
    settings: Settings,
    progress: ProgressTracker,
}

impl<L: Launcher> FetchOrchestrator<L> {
    pub fn new(launcher: L, options: OrchestratorOptions) -> Self {
        Self { launcher, options, settings: Settings::default(), progress: ProgressTracker::new() }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn progress(&self) -> ProgressTracker {
        self.progress.clone_handle()
    }

    /// Resolve the fetcher budget and shard plan for `config` without
    /// spawning anything.
    pub fn plan(&self, config: &RunConfig, comparison_id: &str, concurrency_hint: Option<usize>) -> Result<(FetcherBudget, ShardPlan), ExtractError> {
        config.validate()?;
        let budget = resolve_from_environment(concurrency_hint, &self.settings);
        let plan = plan_jobs(&config.org_usernames(), &config.objects, comparison_id, budget.fetchers);
        Ok((budget, plan))
    }

    pub fn run(&mut self, config: &RunConfig, comparison_id: &str, concurrency_hint: Option<usize>) -> Result<RunSummary, ExtractError> {
        let (budget, plan) = self.plan(config, comparison_id, concurrency_hint)?;
        info!(
            fetchers = budget.fetchers,
            source = ?budget.source,
            orgs = plan.org_count,
            objects = plan.object_count,
            process_per_org = plan.process_per_org,
            jobs = plan.jobs.len(),
            "starting parallel fetchers"
        );
        let data_dir = config.data_dir_for(comparison_id);
        self.execute(&plan, comparison_id, &data_dir, &config.source)
    }

    pub fn execute(
        &mut self,
        plan: &ShardPlan,
        comparison_id: &str,
        data_dir: &Path,
        source: &SourceSpec,
    ) -> Result<RunSummary, ExtractError> {
        let layout = RunLayout::new(data_dir);
        layout.ensure_buffer_dir()?;
        let (events_tx, events) = unbounded::<ChildEvent>();
        let mut children = ChildSet::default();

        children.writer = Some(self.launcher.spawn_writer(data_dir, comparison_id, events_tx.clone())?);
        let address = self.await_writer_ready(&events, &mut children)?;
        info!(%address, "buffer writer ready");

        for job in &plan.jobs {
            let payload = FetcherPayload {
                job: job.clone(),
                data_dir: data_dir.to_path_buf(),
                writer_address: address.clone(),
                source: source.clone(),
            };
            let handle = self.launcher.spawn_fetcher(&payload, events_tx.clone())?;
            info!(fetcher = %job.fetcher_id, org = %job.org, objects = ?job.object_names(), "fetcher spawned");
            self.progress.track_fetcher(&job.fetcher_id, &job.org, &job.object_names());
            children.fetchers.push(FetcherSlot { job: job.clone(), handle, exit: None });
        }
        drop(events_tx);

        let failures = self.await_fetchers(&events, &mut children)?;
        if failures.is_empty() {
            info!("all fetchers completed, waiting for buffers to drain");
        } else {
            warn!(failed = failures.len(), "fetchers settled with failures, draining what was written");
        }

        if let Err(e) = wait_for_drain(&layout.buffer_dir(), self.options.drain_timeout, self.options.drain_poll_interval) {
            error!(error = %e, "buffers did not drain");
            children.kill_all();
            return Err(match e {
                ExtractError::DrainTimeout { waited, pending, .. } => ExtractError::DrainTimeout { waited, pending, failures },
                other => other,
            });
        }

        let writer_exit = self.stop_writer(&mut children);
        children.disarmed = true;
        while let Ok(event) = events.try_recv() {
            self.progress.record(&event.source, &event.message);
        }

        if !failures.is_empty() {
            return Err(ExtractError::FetchersFailed(failures));
        }
        let summary = RunSummary {
            fetcher_count: plan.jobs.len(),
            org_count: plan.org_count,
            object_count: plan.object_count,
            process_per_org: plan.process_per_org,
            data_dir: data_dir.to_path_buf(),
            total_records: self.progress.snapshot().total_records(),
            writer_exit,
        };
        info!(
            fetchers = summary.fetcher_count,
            orgs = summary.org_count,
            objects = summary.object_count,
            records = summary.total_records,
            "fetch run complete"
        );
        Ok(summary)
    }

    fn writer_exit(children: &mut ChildSet) -> Result<Option<Option<i32>>, ExtractError> {
        match children.writer.as_mut() {
            Some(writer) => writer.try_wait(),
            None => Ok(None),
        }
    }

    fn await_writer_ready(&mut self, events: &Receiver<ChildEvent>, children: &mut ChildSet) -> Result<String, ExtractError> {
        let deadline = Instant::now() + self.options.ready_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                error!(timeout = ?self.options.ready_timeout, "buffer writer never signalled ready");
                return Err(ExtractError::WriterNotReady(self.options.ready_timeout));
            }
            match events.recv_timeout(self.options.event_poll.min(deadline - now)) {
                Ok(ChildEvent { source, message: ChildMessage::Ready { address } }) => {
                    self.progress.record(&source, &ChildMessage::Ready { address: address.clone() });
                    return Ok(address);
                }
                Ok(event) => self.progress.record(&event.source, &event.message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(self.options.event_poll),
            }
            if let Some(code) = Self::writer_exit(children)? {
                return Err(ExtractError::WriterExited(code));
            }
        }
    }

    /// Wait until every fetcher has exited. Returns one failure per fetcher
    /// that exited non-zero.
    fn await_fetchers(&mut self, events: &Receiver<ChildEvent>, children: &mut ChildSet) -> Result<Vec<FetcherFailure>, ExtractError> {
        let mut object_errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        loop {
            match events.recv_timeout(self.options.event_poll) {
                Ok(event) => {
                    self.relay(&event, &mut object_errors);
                    while let Ok(event) = events.try_recv() {
                        self.relay(&event, &mut object_errors);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(self.options.event_poll),
            }

            for slot in children.fetchers.iter_mut().filter(|s| s.exit.is_none()) {
                if let Some(code) = slot.handle.try_wait()? {
                    slot.exit = Some(code);
                    self.progress.fetcher_exited(&slot.job.fetcher_id, code);
                    if code == Some(0) {
                        info!(fetcher = %slot.job.fetcher_id, "fetcher completed");
                    } else {
                        error!(fetcher = %slot.job.fetcher_id, code = ?code, "fetcher failed");
                    }
                }
            }
            if let Some(code) = Self::writer_exit(children)? {
                error!(code = ?code, "buffer writer exited while fetchers were running");
                return Err(ExtractError::WriterExited(code));
            }
            if children.fetchers.iter().all(|s| s.exit.is_some()) {
                break;
            }
        }

        // Late messages from fetchers that already exited.
        while let Ok(event) = events.try_recv() {
            self.relay(&event, &mut object_errors);
        }

        let failures = children
            .fetchers
            .iter()
            .filter(|s| s.exit != Some(Some(0)))
            .map(|s| {
                let exit = match s.exit.flatten() {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                };
                let reason = match object_errors.get(&s.job.fetcher_id) {
                    Some(errors) if !errors.is_empty() => format!("{}: {}", exit, errors.join("; ")),
                    _ => exit,
                };
                FetcherFailure {
                    fetcher_id: s.job.fetcher_id.clone(),
                    org: s.job.org.clone(),
                    objects: s.job.object_names(),
                    reason,
                }
            })
            .collect();
        Ok(failures)
    }

    fn relay(&self, event: &ChildEvent, object_errors: &mut BTreeMap<String, Vec<String>>) {
        match &event.message {
            ChildMessage::Progress(p) => debug!(
                fetcher = %event.source,
                org = %p.org,
                object = %p.object,
                page = p.page,
                total = p.total_records,
                "fetch progress"
            ),
            ChildMessage::ObjectDone { org, object, total_records, .. } => {
                info!(fetcher = %event.source, %org, %object, records = total_records, "object done")
            }
            ChildMessage::FetchError { org, object, error } => {
                warn!(fetcher = %event.source, %org, %object, %error, "object failed");
                object_errors
                    .entry(event.source.clone())
                    .or_default()
                    .push(format!("{}: {}", object, error));
            }
            ChildMessage::Ready { .. } => {}
        }
        self.progress.record(&event.source, &event.message);
    }

    /// Close the writer's input, wait out the grace period, then kill it.
    /// Returns the writer's exit code, `None` if it was killed.
    fn stop_writer(&self, children: &mut ChildSet) -> Option<i32> {
        let writer = children.writer.as_mut()?;
        writer.request_shutdown();
        let deadline = Instant::now() + self.options.writer_grace;
        loop {
            match writer.try_wait() {
                Ok(Some(Some(0))) => {
                    info!("buffer writer stopped");
                    return Some(0);
                }
                Ok(Some(code)) => {
                    warn!(code = ?code, "buffer writer stopped with failures, some pages may not have reached their target");
                    return code;
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "cannot poll buffer writer");
                    break;
                }
            }
        }
        warn!(grace = ?self.options.writer_grace, "buffer writer still alive after grace period, killing");
        writer.kill();
        None
    }
}
