use crate::config::SourceSpec;
use crate::layout::sanitize;
use crate::query::QueryPlan;
use crate::ExtractError;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Upstream that answers one GraphQL page request with the raw response.
pub trait RecordSource {
    fn fetch(&mut self, org: &str, plan: &QueryPlan, cursor: Option<&str>) -> Result<Value, ExtractError>;
}

pub fn from_spec(spec: &SourceSpec) -> Box<dyn RecordSource> {
    match spec {
        SourceSpec::SfCli { program } => Box::new(SfCliSource::new(program)),
        SourceSpec::Fixture { dir } => Box::new(FixtureSource::new(dir.clone())),
    }
}

/// Runs `sf api request graphql --target-org <org> --body <query>`.
pub struct SfCliSource {
    program: String,
}

impl SfCliSource {
    pub fn new(program: &str) -> Self {
        Self { program: program.to_string() }
    }
}

impl RecordSource for SfCliSource {
    fn fetch(&mut self, org: &str, plan: &QueryPlan, cursor: Option<&str>) -> Result<Value, ExtractError> {
        let query = plan.render(cursor);
        debug!(org, object = %plan.object, has_cursor = cursor.is_some(), query_len = query.len(), "executing GraphQL query");
        let output = Command::new(&self.program)
            .args(["api", "request", "graphql", "--target-org", org, "--body", &query])
            .output()
            .map_err(|e| ExtractError::Upstream(format!("failed to run {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(ExtractError::Upstream(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(ExtractError::Upstream("Empty CLI response".to_string()));
        }
        serde_json::from_str(stdout.trim()).map_err(|e| {
            let sample: String = stdout.chars().take(500).collect();
            ExtractError::Upstream(format!("JSON parse error: {} (output starts: {})", e, sample))
        })
    }
}

/// Replays recorded responses from `<dir>/<org>/<object>.json`, a JSON array
/// with one response per page. The cursor is the index of the next page.
pub struct FixtureSource {
    dir: PathBuf,
}

impl FixtureSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn fixture_path(&self, org: &str, object: &str) -> PathBuf {
        self.dir.join(sanitize(org)).join(format!("{}.json", object))
    }
}

impl RecordSource for FixtureSource {
    fn fetch(&mut self, org: &str, plan: &QueryPlan, cursor: Option<&str>) -> Result<Value, ExtractError> {
        let path = self.fixture_path(org, &plan.object);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            ExtractError::Upstream(format!("no recorded responses at {}: {}", path.display(), e))
        })?;
        let pages: Vec<Value> = serde_json::from_str(&text)?;
        let index = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| ExtractError::Upstream(format!("bad fixture cursor: {}", c)))?,
            None => 0,
        };
        pages
            .into_iter()
            .nth(index)
            .ok_or_else(|| ExtractError::Upstream(format!("{} has no page {}", path.display(), index)))
    }
}
