use crate::ExtractError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const BUFFER_DIR_NAME: &str = ".buffers";
pub const BUFFER_EXT: &str = "jsonl";
pub const LOCK_EXT: &str = "lock";

pub const QUARANTINE_DIR_NAME: &str = ".quarantine";

const UNNAMED: &str = "unnamed";

/// Replace anything outside `[A-Za-z0-9]` with `_`, collapsing runs and
/// trimming them at both ends. The result never contains `__` and never
/// starts or ends with `_`, so it cannot blur the `__` between org and object
/// in buffer names.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    if out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str(UNNAMED);
    }
    out
}

/// Fields recovered from a buffer file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferMeta {
    pub fetcher_id: String,
    pub page: usize,
    pub org_dir: String,
    pub object: String,
}

/// Paths for one comparison run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub data_dir: PathBuf,
}

impl RunLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn buffer_dir(&self) -> PathBuf {
        self.data_dir.join(BUFFER_DIR_NAME)
    }

    /// Pages whose write never finished are moved here instead of being
    /// appended.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_dir.join(QUARANTINE_DIR_NAME)
    }

    pub fn org_dir(&self, org: &str) -> PathBuf {
        self.data_dir.join(sanitize(org))
    }

    /// Final per-object output, `<data_dir>/<org>/<object>.jsonl`.
    pub fn target_path(&self, org_dir: &str, object: &str) -> PathBuf {
        self.data_dir.join(org_dir).join(format!("{}.{}", object, BUFFER_EXT))
    }

    pub fn buffer_path(&self, fetcher_id: &str, page: usize, org: &str, object: &str) -> PathBuf {
        self.buffer_dir().join(buffer_file_name(fetcher_id, page, org, object))
    }

    pub fn ensure_buffer_dir(&self) -> Result<PathBuf, ExtractError> {
        let dir = self.buffer_dir();
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// `<fetcherId>_page<N>_<org>__<object>.jsonl`
pub fn buffer_file_name(fetcher_id: &str, page: usize, org: &str, object: &str) -> String {
    format!(
        "{}_page{}_{}__{}.{}",
        sanitize(fetcher_id),
        page,
        sanitize(org),
        object,
        BUFFER_EXT
    )
}

pub fn parse_buffer_name(file_name: &str) -> Option<BufferMeta> {
    let stem = file_name.strip_suffix(".jsonl")?;
    let (head, object) = stem.split_once("__")?;
    if object.is_empty() || object.contains('.') {
        return None;
    }
    // Last `_page<digits>_` marker in the head; the org follows it.
    let mut found = None;
    let mut search_from = 0;
    while let Some(pos) = head[search_from..].find("_page") {
        let marker = search_from + pos;
        let digits_start = marker + "_page".len();
        let digits = head[digits_start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .count();
        let after = digits_start + digits;
        if digits > 0 && head[after..].starts_with('_') {
            found = Some((marker, digits_start, after));
        }
        search_from = marker + 1;
    }
    let (marker, digits_start, after) = found?;
    let org_dir = &head[after + 1..];
    if org_dir.is_empty() || marker == 0 {
        return None;
    }
    Some(BufferMeta {
        fetcher_id: head[..marker].to_string(),
        page: head[digits_start..after].parse().ok()?,
        org_dir: org_dir.to_string(),
        object: object.to_string(),
    })
}

/// Marker held while a buffer page is being written.
pub fn lock_path_for(buffer: &Path) -> PathBuf {
    let mut name = buffer.as_os_str().to_os_string();
    name.push(".");
    name.push(LOCK_EXT);
    PathBuf::from(name)
}

fn is_pending(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(BUFFER_EXT) | Some(LOCK_EXT)
    )
}

/// `.jsonl` and `.lock` files still present in the buffer directory. A
/// missing directory has nothing pending.
pub fn pending_files(buffer_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    if !buffer_dir.exists() {
        return Ok(Vec::new());
    }
    let mut pending = Vec::new();
    for entry in fs::read_dir(buffer_dir)? {
        let path = entry?.path();
        if path.is_file() && is_pending(&path) {
            pending.push(path);
        }
    }
    pending.sort();
    Ok(pending)
}

pub fn is_drained(buffer_dir: &Path) -> Result<bool, ExtractError> {
    Ok(pending_files(buffer_dir)?.is_empty())
}

/// Poll until the buffer directory has nothing pending. Fails with
/// `DrainTimeout` once `timeout` has elapsed.
pub fn wait_for_drain(
    buffer_dir: &Path,
    timeout: Duration,
    interval: Duration,
) -> Result<(), ExtractError> {
    let start = Instant::now();
    loop {
        let pending = pending_files(buffer_dir)?;
        if pending.is_empty() {
            info!(buffer_dir = %buffer_dir.display(), "buffer directory is clear");
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(ExtractError::DrainTimeout { waited, pending, failures: Vec::new() });
        }
        debug!(remaining = pending.len(), "waiting for buffer files to be processed");
        std::thread::sleep(interval.min(timeout - waited));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_collapses_runs() {
        assert_eq!(sanitize("dev@example.com"), "dev_example_com");
        assert_eq!(sanitize("a..b@@c"), "a_b_c");
        assert!(!sanitize("x.-_.y").contains("__"));
        assert_eq!(sanitize("dev-"), "dev");
        assert_eq!(sanitize("_-dev.."), "dev");
        assert_eq!(sanitize("@@"), "unnamed");
    }

    #[test]
    fn test_edge_symbols_in_org_keep_object_intact() {
        for org in ["dev-", "-dev", "__dev__", "dev@x.com."] {
            let fetcher_id = format!("{}_0_0", sanitize(org));
            let name = buffer_file_name(&fetcher_id, 7, org, "Account");
            let meta = parse_buffer_name(&name).unwrap();
            assert_eq!(meta.org_dir, sanitize(org), "{}", name);
            assert_eq!(meta.object, "Account", "{}", name);
            assert_eq!(meta.page, 7);
            assert_eq!(meta.fetcher_id, fetcher_id);
            let layout = RunLayout::new("/data");
            assert_eq!(layout.target_path(&meta.org_dir, &meta.object), layout.org_dir(org).join("Account.jsonl"));
        }
    }

    #[test]
    fn test_buffer_name_round_trips_meta() {
        let name = buffer_file_name("dev_example_com_0_1", 12, "dev@example.com", "SBQQ__Quote__c");
        assert_eq!(name, "dev_example_com_0_1_page12_dev_example_com__SBQQ__Quote__c.jsonl");
        let meta = parse_buffer_name(&name).unwrap();
        assert_eq!(meta.fetcher_id, "dev_example_com_0_1");
        assert_eq!(meta.page, 12);
        assert_eq!(meta.org_dir, "dev_example_com");
        assert_eq!(meta.object, "SBQQ__Quote__c");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert_eq!(parse_buffer_name("random.jsonl"), None);
        assert_eq!(parse_buffer_name("abc_page_org__Obj.jsonl"), None);
        assert_eq!(parse_buffer_name("abc_page1_org__Obj.txt"), None);
        assert_eq!(parse_buffer_name("abc_page1___Obj.jsonl"), None);
    }

    #[test]
    fn test_org_containing_page_word() {
        let name = buffer_file_name("f_0", 3, "homepage@x.io", "Account");
        let meta = parse_buffer_name(&name).unwrap();
        assert_eq!(meta.org_dir, "homepage_x_io");
        assert_eq!(meta.object, "Account");
    }

    #[test]
    fn test_pending_counts_jsonl_and_lock_only() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_drained(&dir.path().join("missing")).unwrap());

        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert!(is_drained(dir.path()).unwrap());

        let buffer = dir.path().join("f_page0_o__A.jsonl");
        fs::write(lock_path_for(&buffer), "").unwrap();
        assert_eq!(pending_files(dir.path()).unwrap().len(), 1);
        fs::write(&buffer, "{}\n").unwrap();
        assert_eq!(pending_files(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_wait_for_drain_times_out() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f_page0_o__A.jsonl"), "{}\n").unwrap();
        let start = Instant::now();
        let err = wait_for_drain(dir.path(), Duration::from_millis(200), Duration::from_millis(50))
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(200 + 500));
        match err {
            ExtractError::DrainTimeout { pending, .. } => assert_eq!(pending.len(), 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_wait_for_drain_sees_removal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f_page0_o__A.jsonl");
        fs::write(&file, "{}\n").unwrap();
        let remover = {
            let file = file.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                fs::remove_file(file).unwrap();
            })
        };
        wait_for_drain(dir.path(), Duration::from_secs(5), Duration::from_millis(20)).unwrap();
        remover.join().unwrap();
    }
}
