use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One fetcher that did not finish cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherFailure {
    pub fetcher_id: String,
    pub org: String,
    pub objects: Vec<String>,
    pub reason: String,
}

impl fmt::Display for FetcherFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (org {}, objects [{}]): {}",
            self.fetcher_id,
            self.org,
            self.objects.join(", "),
            self.reason
        )
    }
}

#[derive(Debug)]
pub enum ExtractError {
    Spawn { role: String, source: std::io::Error },
    WriterNotReady(Duration),
    WriterExited(Option<i32>),
    FetchersFailed(Vec<FetcherFailure>),
    /// `failures` holds the fetchers that had already failed when the drain
    /// gave up.
    DrainTimeout { waited: Duration, pending: Vec<PathBuf>, failures: Vec<FetcherFailure> },
    Conversion { input: PathBuf, reason: String },
    Upstream(String),
    Protocol(String),
    Config(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::Spawn { role, source } => {
                write!(f, "Spawn error: could not start {}: {}", role, source)
            }
            ExtractError::WriterNotReady(waited) => write!(
                f,
                "Buffer writer did not signal ready within {}ms",
                waited.as_millis()
            ),
            ExtractError::WriterExited(code) => match code {
                Some(code) => write!(f, "Buffer writer exited early with code {}", code),
                None => write!(f, "Buffer writer was terminated early by a signal"),
            },
            ExtractError::FetchersFailed(failures) => {
                write!(f, "{} fetcher(s) failed:", failures.len())?;
                for failure in failures {
                    write!(f, "\n  - {}", failure)?;
                }
                Ok(())
            }
            ExtractError::DrainTimeout { waited, pending, failures } => {
                write!(
                    f,
                    "Buffers did not drain within {}ms ({} file(s) pending)",
                    waited.as_millis(),
                    pending.len()
                )?;
                if !failures.is_empty() {
                    write!(f, "; {} fetcher(s) also failed:", failures.len())?;
                    for failure in failures {
                        write!(f, "\n  - {}", failure)?;
                    }
                }
                Ok(())
            }
            ExtractError::Conversion { input, reason } => {
                write!(f, "Conversion error for {}: {}", input.display(), reason)
            }
            ExtractError::Upstream(e) => write!(f, "Upstream error: {}", e),
            ExtractError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ExtractError::Config(e) => write!(f, "Config error: {}", e),
            ExtractError::Io(e) => write!(f, "IO error: {}", e),
            ExtractError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::Spawn { source, .. } => Some(source),
            ExtractError::Io(e) => Some(e),
            ExtractError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExtractError {
    fn from(err: std::io::Error) -> Self {
        ExtractError::Io(err)
    }
}

impl From<serde_json::Error> for ExtractError {
    fn from(err: serde_json::Error) -> Self {
        ExtractError::Json(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetchers_failed_lists_every_job() {
        let err = ExtractError::FetchersFailed(vec![
            FetcherFailure {
                fetcher_id: "a_0".to_string(),
                org: "a".to_string(),
                objects: vec!["Account".to_string()],
                reason: "exited with code 1".to_string(),
            },
            FetcherFailure {
                fetcher_id: "b_0".to_string(),
                org: "b".to_string(),
                objects: vec!["Contact".to_string(), "Lead".to_string()],
                reason: "exited with code 2".to_string(),
            },
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 fetcher(s) failed"));
        assert!(text.contains("a_0 (org a, objects [Account]): exited with code 1"));
        assert!(text.contains("b_0 (org b, objects [Contact, Lead])"));
    }

    #[test]
    fn test_drain_timeout_names_failed_fetchers() {
        let err = ExtractError::DrainTimeout {
            waited: Duration::from_millis(300),
            pending: vec![PathBuf::from("a_0_0_page0_a__X.jsonl")],
            failures: vec![FetcherFailure {
                fetcher_id: "b_0".to_string(),
                org: "b".to_string(),
                objects: vec!["X".to_string()],
                reason: "exited with code 1".to_string(),
            }],
        };
        let text = err.to_string();
        assert!(text.starts_with("Buffers did not drain within 300ms (1 file(s) pending)"));
        assert!(text.contains("b_0 (org b, objects [X]): exited with code 1"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ExtractError = io.into();
        assert!(matches!(err, ExtractError::Io(_)));
        assert_eq!(err.to_string(), "IO error: gone");
    }
}
