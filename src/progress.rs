use crate::protocol::ChildMessage;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

const MAX_EVENTS: usize = 100;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ObjectState {
    #[default]
    Pending,
    Fetching,
    Done,
    Failed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectProgress {
    pub state: ObjectState,
    pub pages: usize,
    pub records: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetcherState {
    Running,
    Exited(Option<i32>),
}

#[derive(Clone, Debug)]
pub struct EventEntry {
    pub timestamp: u64,
    pub source: String,
    pub message: String,
}

struct ProgressInner {
    started: Instant,
    objects: BTreeMap<(String, String), ObjectProgress>,
    fetchers: BTreeMap<String, FetcherState>,
    events: VecDeque<EventEntry>,
}

/// Shared view of a run, fed from child messages.
pub struct ProgressTracker {
    inner: Arc<Mutex<ProgressInner>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProgressInner {
                started: Instant::now(),
                objects: BTreeMap::new(),
                fetchers: BTreeMap::new(),
                events: VecDeque::with_capacity(MAX_EVENTS),
            })),
        }
    }

    pub fn clone_handle(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    /// Register the objects a fetcher is about to work on.
    pub fn track_fetcher(&self, fetcher_id: &str, org: &str, objects: &[String]) {
        let mut inner = self.lock();
        inner.fetchers.insert(fetcher_id.to_string(), FetcherState::Running);
        for object in objects {
            inner
                .objects
                .entry((org.to_string(), object.clone()))
                .or_default();
        }
    }

    pub fn fetcher_exited(&self, fetcher_id: &str, code: Option<i32>) {
        let mut inner = self.lock();
        inner.fetchers.insert(fetcher_id.to_string(), FetcherState::Exited(code));
    }

    pub fn record(&self, source: &str, message: &ChildMessage) {
        let mut inner = self.lock();
        let text = match message {
            ChildMessage::Ready { address } => format!("ready at {}", address),
            ChildMessage::Progress(p) => {
                let entry = inner.objects.entry((p.org.clone(), p.object.clone())).or_default();
                entry.state = ObjectState::Fetching;
                entry.pages = p.page;
                entry.records = p.total_records;
                format!("{} {} page {} (+{} = {})", p.org, p.object, p.page, p.records_in_page, p.total_records)
            }
            ChildMessage::ObjectDone { org, object, total_records, pages } => {
                let entry = inner.objects.entry((org.clone(), object.clone())).or_default();
                entry.state = ObjectState::Done;
                entry.pages = *pages;
                entry.records = *total_records;
                format!("{} {} done with {} records", org, object, total_records)
            }
            ChildMessage::FetchError { org, object, error } => {
                let entry = inner.objects.entry((org.clone(), object.clone())).or_default();
                entry.state = ObjectState::Failed(error.clone());
                format!("{} {} failed: {}", org, object, error)
            }
        };
        inner.events.push_back(EventEntry {
            timestamp: Self::current_timestamp(),
            source: source.to_string(),
            message: text,
        });
        if inner.events.len() > MAX_EVENTS {
            inner.events.pop_front();
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.lock();
        ProgressSnapshot {
            elapsed_secs: inner.started.elapsed().as_secs_f64(),
            objects: inner.objects.clone(),
            fetchers: inner.fetchers.clone(),
            events: inner.events.iter().cloned().collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProgressSnapshot {
    pub elapsed_secs: f64,
    pub objects: BTreeMap<(String, String), ObjectProgress>,
    pub fetchers: BTreeMap<String, FetcherState>,
    pub events: Vec<EventEntry>,
}

impl ProgressSnapshot {
    pub fn total_records(&self) -> usize {
        self.objects.values().map(|o| o.records).sum()
    }

    pub fn completed_objects(&self) -> usize {
        self.objects.values().filter(|o| o.state == ObjectState::Done).count()
    }

    pub fn failed_objects(&self) -> Vec<(String, String, String)> {
        self.objects
            .iter()
            .filter_map(|((org, object), p)| match &p.state {
                ObjectState::Failed(e) => Some((org.clone(), object.clone(), e.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn running_fetchers(&self) -> usize {
        self.fetchers.values().filter(|s| **s == FetcherState::Running).count()
    }
}
