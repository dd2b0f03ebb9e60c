//! JSONL to Parquet conversion by shelling out to an external converter.
//! Independent of the fetch pipeline: failures here are reported per file.

use crate::layout::{BUFFER_DIR_NAME, QUARANTINE_DIR_NAME};
use crate::ExtractError;
use crossbeam_channel::unbounded;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

const CONVERT_SCRIPT: &str = r#"
import json, sys
from pathlib import Path
import pandas as pd

def optimize(df):
    for column in df.columns:
        if column.startswith('_'):
            continue
        if df[column].dtype == 'object':
            try:
                if df[column].nunique() / len(df) < 0.5:
                    df[column] = df[column].astype('category')
            except Exception:
                pass
        elif df[column].dtype == 'float64':
            if df[column].notna().all() and (df[column] % 1 == 0).all():
                df[column] = df[column].astype('int64')
    return df

def main(src, dst):
    records = []
    with open(src, 'r', encoding='utf-8') as f:
        for n, line in enumerate(f, 1):
            line = line.strip()
            if not line:
                continue
            try:
                records.append(json.loads(line))
            except json.JSONDecodeError as e:
                print(f"Warning: failed to parse line {n}: {e}")
    if not records:
        raise ValueError("No valid records found in JSONL file")
    df = optimize(pd.DataFrame(records))
    print(f"DataFrame shape: {df.shape}")
    df.to_parquet(dst, index=False, compression='snappy')
    print(f"Created {dst} ({Path(dst).stat().st_size} bytes)")

if __name__ == '__main__':
    if len(sys.argv) != 3:
        print("usage: <input_jsonl> <output_parquet>", file=sys.stderr)
        sys.exit(2)
    try:
        main(sys.argv[1], sys.argv[2])
    except Exception as e:
        print(f"Conversion failed: {e}", file=sys.stderr)
        sys.exit(1)
"#;

/// `foo.jsonl` becomes `foo.parquet`.
pub fn parquet_path_for(jsonl: &Path) -> PathBuf {
    jsonl.with_extension("parquet")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutput {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub output_size: u64,
    pub log: String,
}

#[derive(Debug)]
pub struct ConversionResult {
    pub input: PathBuf,
    pub outcome: Result<ConversionOutput, ExtractError>,
}

#[derive(Debug, Default)]
pub struct AutoConvertReport {
    pub converted: usize,
    pub failed: usize,
    pub up_to_date: usize,
    pub results: Vec<ConversionResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionStats {
    pub total_jsonl: usize,
    pub has_parquet: usize,
    pub up_to_date: usize,
    pub needs_conversion: usize,
    pub total_size_jsonl: u64,
    pub total_size_parquet: u64,
}

#[derive(Debug, Clone)]
pub struct ParquetConverter {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Default for ParquetConverter {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-c".to_string(), CONVERT_SCRIPT.to_string()],
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut text);
        }
        text
    })
}

impl ParquetConverter {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Convert one file. The output defaults to the input with a `.parquet`
    /// extension. The converter is killed if it outlives the timeout.
    pub fn convert(&self, input: &Path, output: Option<&Path>) -> Result<ConversionOutput, ExtractError> {
        let fail = |reason: String| ExtractError::Conversion { input: input.to_path_buf(), reason };
        if !input.is_file() {
            return Err(fail("input file not found".to_string()));
        }
        let output = output.map(Path::to_path_buf).unwrap_or_else(|| parquet_path_for(input));
        info!(input = %input.display(), output = %output.display(), "converting to parquet");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(input)
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail(format!("failed to spawn {}: {}", self.program, e)))?;
        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let started = Instant::now();
        let status = match wait_or_kill(&mut child, self.timeout) {
            Ok(status) => status,
            Err(WaitFailure::TimedOut) => {
                warn!(input = %input.display(), timeout = ?self.timeout, "conversion timed out, killed converter");
                return Err(fail(format!("conversion timed out after {:?}", self.timeout)));
            }
            Err(WaitFailure::Poll(e)) => {
                warn!(input = %input.display(), error = %e, "lost track of converter, killed it");
                return Err(fail(format!("cannot poll converter: {}", e)));
            }
        };
        let log = stdout.join().unwrap_or_default();
        let errors = stderr.join().unwrap_or_default();

        if !status.success() {
            return Err(fail(format!("converter exited with {}: {}", status, errors.trim())));
        }
        let output_size = fs::metadata(&output)
            .map_err(|_| fail("parquet file was not created".to_string()))?
            .len();
        debug!(output = %output.display(), output_size, elapsed = ?started.elapsed(), "conversion finished");
        Ok(ConversionOutput { input_path: input.to_path_buf(), output_path: output, output_size, log })
    }

    /// Convert each path with at most `max_concurrent` converters running.
    /// Results come back in input order; a failure never stops the batch.
    pub fn convert_many(&self, paths: &[PathBuf], max_concurrent: usize) -> Vec<ConversionResult> {
        let (work_tx, work_rx) = unbounded::<(usize, PathBuf)>();
        for item in paths.iter().cloned().enumerate() {
            let _ = work_tx.send(item);
        }
        drop(work_tx);

        let (done_tx, done_rx) = unbounded::<(usize, ConversionResult)>();
        let workers = max_concurrent.max(1).min(paths.len().max(1));
        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for (index, path) in work_rx.iter() {
                        let outcome = self.convert(&path, None);
                        if let Err(e) = &outcome {
                            warn!(error = %e, "conversion failed");
                        }
                        let _ = done_tx.send((index, ConversionResult { input: path, outcome }));
                    }
                });
            }
        });
        drop(done_tx);

        let mut results: Vec<(usize, ConversionResult)> = done_rx.iter().collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Convert every JSONL file under `dir` whose parquet is missing or
    /// stale (all of them with `force`).
    pub fn auto_convert(&self, dir: &Path, recursive: bool, force: bool) -> Result<AutoConvertReport, ExtractError> {
        let files = find_jsonl_files(dir, recursive)?;
        let needed: Vec<PathBuf> = files
            .iter()
            .filter(|p| force || !is_up_to_date(p, &parquet_path_for(p)))
            .cloned()
            .collect();
        info!(dir = %dir.display(), found = files.len(), needed = needed.len(), "auto-converting JSONL files");

        let mut report = AutoConvertReport { up_to_date: files.len() - needed.len(), ..Default::default() };
        if needed.is_empty() {
            return Ok(report);
        }
        report.results = self.convert_many(&needed, DEFAULT_MAX_CONCURRENT);
        report.converted = report.results.iter().filter(|r| r.outcome.is_ok()).count();
        report.failed = report.results.len() - report.converted;
        Ok(report)
    }
}

/// True when the parquet exists and is not older than the JSONL.
pub fn is_up_to_date(jsonl: &Path, parquet: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(jsonl), modified(parquet)) {
        (Some(source), Some(converted)) => converted >= source,
        _ => false,
    }
}

/// JSONL files in `dir`, sorted. Buffer directories are never scanned.
trait ConverterProcess {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;
    fn kill(&mut self);
}

impl ConverterProcess for Child {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn kill(&mut self) {
        let _ = Child::kill(self);
        let _ = Child::wait(self);
    }
}

#[derive(Debug)]
enum WaitFailure {
    TimedOut,
    Poll(std::io::Error),
}

/// Poll until exit. On timeout or a polling error the process is killed.
fn wait_or_kill(process: &mut impl ConverterProcess, timeout: Duration) -> Result<ExitStatus, WaitFailure> {
    let started = Instant::now();
    loop {
        match process.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                process.kill();
                return Err(WaitFailure::Poll(e));
            }
        }
        if started.elapsed() >= timeout {
            process.kill();
            return Err(WaitFailure::TimedOut);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn find_jsonl_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, ExtractError> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                if recursive && path.file_name().is_some_and(|n| n != BUFFER_DIR_NAME && n != QUARANTINE_DIR_NAME) {
                    pending.push(path);
                }
            } else if path.extension().is_some_and(|e| e == "jsonl") {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

pub fn stats(dir: &Path) -> Result<ConversionStats, ExtractError> {
    let mut stats = ConversionStats::default();
    for jsonl in find_jsonl_files(dir, true)? {
        stats.total_jsonl += 1;
        stats.total_size_jsonl += fs::metadata(&jsonl)?.len();
        let parquet = parquet_path_for(&jsonl);
        match fs::metadata(&parquet) {
            Ok(meta) => {
                stats.has_parquet += 1;
                stats.total_size_parquet += meta.len();
                if is_up_to_date(&jsonl, &parquet) {
                    stats.up_to_date += 1;
                } else {
                    stats.needs_conversion += 1;
                }
            }
            Err(_) => stats.needs_conversion += 1,
        }
    }
    Ok(stats)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    struct UnpollableProcess {
        killed: bool,
    }

    impl ConverterProcess for UnpollableProcess {
        fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
            Err(std::io::Error::other("wait failed"))
        }

        fn kill(&mut self) {
            self.killed = true;
        }
    }

    #[test]
    fn test_poll_error_kills_converter() {
        let mut process = UnpollableProcess { killed: false };
        let err = wait_or_kill(&mut process, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, WaitFailure::Poll(_)));
        assert!(process.killed);
    }

    fn copying_converter() -> ParquetConverter {
        ParquetConverter {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "cp \"$1\" \"$2\"".to_string(), "sh".to_string()],
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_convert_writes_default_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Account.jsonl");
        fs::write(&input, "{\"Id\":\"1\"}\n").unwrap();

        let out = copying_converter().convert(&input, None).unwrap();
        assert_eq!(out.output_path, dir.path().join("Account.parquet"));
        assert_eq!(out.output_size, 11);
        assert!(is_up_to_date(&input, &out.output_path));
    }

    #[test]
    fn test_convert_failures() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("A.jsonl");
        let missing = copying_converter().convert(&input, None).unwrap_err();
        assert!(matches!(missing, ExtractError::Conversion { .. }));

        fs::write(&input, "{}\n").unwrap();
        let failing = ParquetConverter {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo broken >&2; exit 3".to_string(), "sh".to_string()],
            timeout: Duration::from_secs(10),
        };
        let err = failing.convert(&input, None).unwrap_err().to_string();
        assert!(err.contains("broken"), "{}", err);

        let silent = ParquetConverter {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "true".to_string(), "sh".to_string()],
            timeout: Duration::from_secs(10),
        };
        let err = silent.convert(&input, None).unwrap_err().to_string();
        assert!(err.contains("not created"), "{}", err);
    }

    #[test]
    fn test_convert_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("A.jsonl");
        fs::write(&input, "{}\n").unwrap();
        let slow = ParquetConverter {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exec sleep 5".to_string(), "sh".to_string()],
            timeout: Duration::from_millis(200),
        };
        let start = Instant::now();
        let err = slow.convert(&input, None).unwrap_err().to_string();
        assert!(err.contains("timed out"), "{}", err);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_auto_convert_skips_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let org = dir.path().join("dev_x_com");
        fs::create_dir_all(org.join(".buffers")).unwrap();
        fs::create_dir_all(dir.path().join(".buffers")).unwrap();
        fs::write(dir.path().join(".buffers").join("x_page0_o__A.jsonl"), "{}\n").unwrap();
        for name in ["A", "B", "C"] {
            fs::write(org.join(format!("{}.jsonl", name)), "{}\n").unwrap();
        }
        fs::write(org.join("A.parquet"), "old").unwrap();
        fs::write(org.join("B.parquet"), "stale").unwrap();
        set_file_mtime(org.join("B.parquet"), FileTime::from_unix_time(1_000, 0)).unwrap();

        let before = stats(dir.path()).unwrap();
        assert_eq!(before.total_jsonl, 3);
        assert_eq!(before.has_parquet, 2);
        assert_eq!(before.up_to_date, 1);
        assert_eq!(before.needs_conversion, 2);

        let converter = copying_converter();
        assert_eq!(converter.auto_convert(dir.path(), false, false).unwrap().results.len(), 0);
        let report = converter.auto_convert(dir.path(), true, false).unwrap();
        assert_eq!(report.converted, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.up_to_date, 1);

        let forced = converter.auto_convert(dir.path(), true, true).unwrap();
        assert_eq!(forced.converted, 3);
        assert_eq!(stats(dir.path()).unwrap().up_to_date, 3);
    }

    #[test]
    fn test_convert_many_keeps_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..5 {
            let p = dir.path().join(format!("{}.jsonl", i));
            fs::write(&p, "{}\n").unwrap();
            paths.push(p);
        }
        paths.insert(2, dir.path().join("missing.jsonl"));
        let results = copying_converter().convert_many(&paths, 2);
        assert_eq!(results.len(), 6);
        for (result, path) in results.iter().zip(&paths) {
            assert_eq!(&result.input, path);
        }
        assert!(results[2].outcome.is_err());
        assert_eq!(results.iter().filter(|r| r.outcome.is_ok()).count(), 5);
    }
}
