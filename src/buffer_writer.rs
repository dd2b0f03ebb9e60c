//! The single process allowed to mutate the buffer directory and the
//! per-object output files.
//!
//! Fetchers connect over loopback TCP and send one `AppendRequest` per page.
//! Each page is staged as `<.buffers>/<fetcher>_page<N>_<org>__<object>.jsonl`
//! (guarded by a `.lock` marker while it is written), acknowledged, and then
//! appended to `<data_dir>/<org>/<object>.jsonl` by one appender thread, which
//! deletes the staged page afterwards. An empty buffer directory therefore
//! means every acknowledged page has reached its target file.

use crate::layout::{self, lock_path_for, parse_buffer_name, RunLayout};
use crate::protocol::{read_json_line, write_json_line, AppendAck, AppendRequest, ChildMessage};
use crate::ExtractError;
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use std::fs::{self, OpenOptions};
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// How often the appender looks for pages nobody queued.
    pub sweep_interval: Duration,
    /// Pages untouched for this long are picked up by the periodic sweep.
    pub stale_after: Duration,
    /// A `.lock` older than this belongs to a write that will never finish.
    pub stale_lock_after: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
            stale_lock_after: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub pages_appended: usize,
    pub records_appended: usize,
    pub empty_pages: usize,
    pub quarantined: usize,
    pub failures: usize,
}

impl WriterStats {
    fn absorb(&mut self, other: &WriterStats) {
        self.pages_appended += other.pages_appended;
        self.records_appended += other.records_appended;
        self.empty_pages += other.empty_pages;
        self.quarantined += other.quarantined;
        self.failures += other.failures;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { target: PathBuf, lines: usize },
    Empty,
    /// Already consumed, or still being written.
    Skipped,
    Malformed,
}

enum AppendCommand {
    Staged(PathBuf),
    Finish,
}

/// Write one page into the buffer directory. The `.lock` marker exists for
/// exactly as long as the page file is incomplete.
pub fn stage_page(layout: &RunLayout, request: &AppendRequest) -> Result<PathBuf, ExtractError> {
    let path = layout.buffer_path(&request.fetcher_id, request.page, &request.org, &request.object);
    let lock = lock_path_for(&path);
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock)
        .map_err(|e| ExtractError::Protocol(format!("cannot lock {}: {}", path.display(), e)))?;

    let written = (|| -> Result<(), ExtractError> {
        let mut body = Vec::new();
        for record in &request.records {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = fs::remove_file(&lock) {
        warn!(lock = %lock.display(), error = %e, "failed to remove lock marker");
    }
    written.map(|_| path)
}

/// Move one staged page into its target file and delete it.
pub fn append_buffer(layout: &RunLayout, buffer: &Path) -> Result<AppendOutcome, ExtractError> {
    if !buffer.exists() || lock_path_for(buffer).exists() {
        return Ok(AppendOutcome::Skipped);
    }
    let Some(meta) = buffer
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_buffer_name)
    else {
        warn!(file = %buffer.display(), "skipping malformed buffer filename");
        return Ok(AppendOutcome::Malformed);
    };

    let content = fs::read_to_string(buffer)?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        fs::remove_file(buffer)?;
        debug!(file = %buffer.display(), "deleted empty buffer file");
        return Ok(AppendOutcome::Empty);
    }

    let target = layout.target_path(&meta.org_dir, &meta.object);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = OpenOptions::new().create(true).append(true).open(&target)?;
    let mut body = String::with_capacity(content.len());
    for line in &lines {
        body.push_str(line);
        body.push('\n');
    }
    out.write_all(body.as_bytes())?;
    out.sync_all()?;
    fs::remove_file(buffer)?;

    info!(
        from = %buffer.display(),
        to = %target.display(),
        lines = lines.len(),
        "appended buffer to target"
    );
    Ok(AppendOutcome::Appended { target, lines: lines.len() })
}

fn record_outcome(stats: &mut WriterStats, outcome: Result<AppendOutcome, ExtractError>, buffer: &Path) {
    match outcome {
        Ok(AppendOutcome::Appended { lines, .. }) => {
            stats.pages_appended += 1;
            stats.records_appended += lines;
        }
        Ok(AppendOutcome::Empty) => stats.empty_pages += 1,
        Ok(AppendOutcome::Skipped) | Ok(AppendOutcome::Malformed) => {}
        Err(e) => {
            stats.failures += 1;
            error!(file = %buffer.display(), error = %e, "append failed");
        }
    }
}

fn file_age(path: &Path, now: SystemTime) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| now.duration_since(modified).unwrap_or_default())
        .unwrap_or_default()
}

/// Release `.lock` markers older than `min_age`. The page behind such a lock
/// was never acknowledged and may be truncated, so it is moved to the
/// quarantine directory rather than appended.
pub fn reclaim_stale_locks(layout: &RunLayout, min_age: Duration, stats: &mut WriterStats) -> Result<usize, ExtractError> {
    let buffer_dir = layout.buffer_dir();
    if !buffer_dir.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut reclaimed = 0;
    for entry in fs::read_dir(&buffer_dir)? {
        let lock = entry?.path();
        if lock.extension().and_then(|e| e.to_str()) != Some(layout::LOCK_EXT) {
            continue;
        }
        if file_age(&lock, now) < min_age {
            continue;
        }
        let page = lock.with_extension("");
        if page.exists() {
            let quarantine = layout.quarantine_dir();
            fs::create_dir_all(&quarantine)?;
            let Some(name) = page.file_name() else { continue };
            let dest = quarantine.join(name);
            fs::rename(&page, &dest)?;
            stats.quarantined += 1;
            warn!(from = %page.display(), to = %dest.display(), "quarantined unfinished buffer page");
        }
        fs::remove_file(&lock)?;
        warn!(lock = %lock.display(), "removed abandoned lock marker");
        reclaimed += 1;
    }
    Ok(reclaimed)
}

/// Appended in (fetcher, page) order; names that do not parse go last.
fn append_order(path: &Path) -> (bool, String, usize, PathBuf) {
    match path.file_name().and_then(|n| n.to_str()).and_then(parse_buffer_name) {
        Some(meta) => (false, meta.fetcher_id, meta.page, path.to_path_buf()),
        None => (true, String::new(), 0, path.to_path_buf()),
    }
}

/// Append every buffer page idle for at least `min_idle`.
pub fn sweep(layout: &RunLayout, min_idle: Duration, stats: &mut WriterStats) -> Result<usize, ExtractError> {
    let buffer_dir = layout.buffer_dir();
    if !buffer_dir.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut candidates = Vec::new();
    for entry in fs::read_dir(&buffer_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(layout::BUFFER_EXT) {
            continue;
        }
        if file_age(&path, now) >= min_idle {
            candidates.push(path);
        }
    }
    candidates.sort_by_cached_key(|p| append_order(p));
    if !candidates.is_empty() {
        debug!(count = candidates.len(), "sweep found buffer files");
    }
    for path in &candidates {
        record_outcome(stats, append_buffer(layout, path), path);
    }
    Ok(candidates.len())
}

fn handle_connection(stream: TcpStream, layout: RunLayout, queue: Sender<AppendCommand>) -> Result<(), ExtractError> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr().ok();
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    loop {
        let request: AppendRequest = match read_json_line(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                let _ = write_json_line(&mut writer, &AppendAck::failed(e.to_string()));
                return Err(e);
            }
        };
        let ack = match stage_page(&layout, &request) {
            Ok(path) => {
                let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                let _ = queue.send(AppendCommand::Staged(path));
                AppendAck::staged(name)
            }
            Err(e) => {
                error!(org = %request.org, object = %request.object, page = request.page, error = %e, "failed to stage page");
                AppendAck::failed(e.to_string())
            }
        };
        write_json_line(&mut writer, &ack)?;
    }
    debug!(?peer, "fetcher connection closed");
    Ok(())
}

pub struct BufferWriter {
    layout: RunLayout,
    listener: TcpListener,
    options: WriterOptions,
}

impl BufferWriter {
    /// Create the buffer directory and bind a loopback listener on an
    /// ephemeral port.
    pub fn bind(layout: RunLayout, options: WriterOptions) -> Result<Self, ExtractError> {
        layout.ensure_buffer_dir()?;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        Ok(Self { layout, listener, options })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ExtractError> {
        Ok(self.listener.local_addr()?)
    }

    /// Append leftovers from an earlier run, regardless of age. No writer is
    /// serving yet, so every lock left behind is abandoned.
    pub fn recover(&self) -> Result<WriterStats, ExtractError> {
        let mut stats = WriterStats::default();
        reclaim_stale_locks(&self.layout, Duration::ZERO, &mut stats)?;
        let found = sweep(&self.layout, Duration::ZERO, &mut stats)?;
        if found > 0 {
            info!(found, "processed existing buffer files");
        }
        Ok(stats)
    }

    /// Accept fetchers until `shutdown` fires, then finish queued pages, run
    /// a last sweep and return totals.
    pub fn serve(self, shutdown: Receiver<()>) -> Result<WriterStats, ExtractError> {
        let (queue_tx, queue_rx) = unbounded::<AppendCommand>();
        let stop = Arc::new(AtomicBool::new(false));

        let appender = {
            let layout = self.layout.clone();
            let options = self.options.clone();
            thread::Builder::new()
                .name("appender".to_string())
                .spawn(move || run_appender(layout, options, queue_rx))?
        };

        self.listener.set_nonblocking(true)?;
        let acceptor = {
            let layout = self.layout.clone();
            let stop = stop.clone();
            let queue_tx = queue_tx.clone();
            let listener = self.listener;
            thread::Builder::new().name("acceptor".to_string()).spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            debug!(%peer, "fetcher connected");
                            let layout = layout.clone();
                            let queue = queue_tx.clone();
                            let spawned = thread::Builder::new()
                                .name("writer-conn".to_string())
                                .spawn(move || {
                                    if let Err(e) = handle_connection(stream, layout, queue) {
                                        warn!(error = %e, "fetcher connection ended with error");
                                    }
                                });
                            if let Err(e) = spawned {
                                error!(error = %e, "cannot start connection thread");
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(20));
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })?
        };

        let _ = shutdown.recv();
        info!("shutdown requested, finishing queued buffers");
        stop.store(true, Ordering::SeqCst);
        let _ = acceptor.join();
        let _ = queue_tx.send(AppendCommand::Finish);
        appender
            .join()
            .map_err(|_| ExtractError::Protocol("appender thread panicked".to_string()))
    }
}

fn run_appender(layout: RunLayout, options: WriterOptions, queue: Receiver<AppendCommand>) -> WriterStats {
    let mut stats = WriterStats::default();
    let ticker = tick(options.sweep_interval);
    loop {
        select! {
            recv(queue) -> command => match command {
                Ok(AppendCommand::Staged(path)) => {
                    let outcome = append_buffer(&layout, &path);
                    record_outcome(&mut stats, outcome, &path);
                }
                Ok(AppendCommand::Finish) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                if let Err(e) = reclaim_stale_locks(&layout, options.stale_lock_after, &mut stats) {
                    error!(error = %e, "failed to reclaim stale locks");
                }
                if let Err(e) = sweep(&layout, options.stale_after, &mut stats) {
                    error!(error = %e, "error in periodic check");
                }
            }
        }
    }
    // Connections may still be finishing their last page; drain whatever
    // was queued after Finish, then sweep everything left.
    while let Ok(command) = queue.try_recv() {
        if let AppendCommand::Staged(path) = command {
            let outcome = append_buffer(&layout, &path);
            record_outcome(&mut stats, outcome, &path);
        }
    }
    if let Err(e) = sweep(&layout, Duration::ZERO, &mut stats) {
        error!(error = %e, "final sweep failed");
    }
    info!(
        pages = stats.pages_appended,
        records = stats.records_appended,
        failures = stats.failures,
        "appender finished"
    );
    stats
}

/// Body of the `buffer_writer` binary: recover, announce readiness on stdout,
/// serve until stdin closes.
pub fn run_writer_process(layout: RunLayout, options: WriterOptions) -> Result<WriterStats, ExtractError> {
    let writer = BufferWriter::bind(layout.clone(), options)?;
    let recovered = writer.recover()?;
    let address = writer.local_addr()?;
    info!(data_dir = %layout.data_dir.display(), %address, pid = std::process::id(), "buffer writer started");

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    thread::Builder::new().name("stdin-watch".to_string()).spawn(move || {
        let _ = std::io::copy(&mut std::io::stdin().lock(), &mut std::io::sink());
        let _ = shutdown_tx.send(());
    })?;

    crate::protocol::emit(&ChildMessage::Ready { address: address.to_string() })?;
    let mut stats = writer.serve(shutdown_rx)?;
    stats.absorb(&recovered);
    Ok(stats)
}

/// Fetcher-side connection to the buffer writer.
pub struct WriterClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl WriterClient {
    pub fn connect(address: &str, timeout: Duration) -> Result<Self, ExtractError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ExtractError::Config(format!("bad writer address '{}': {}", address, e)))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        Ok(Self { reader: BufReader::new(stream.try_clone()?), writer: stream })
    }

    /// Send one page and wait until the writer has staged it. Returns the
    /// buffer file name.
    pub fn append(&mut self, request: &AppendRequest) -> Result<String, ExtractError> {
        write_json_line(&mut self.writer, request)?;
        let ack: AppendAck = read_json_line(&mut self.reader)?
            .ok_or_else(|| ExtractError::Protocol("buffer writer closed the connection".to_string()))?;
        if ack.ok {
            Ok(ack.buffer_file.unwrap_or_default())
        } else {
            Err(ExtractError::Protocol(ack.error.unwrap_or_else(|| "append rejected".to_string())))
        }
    }
}
