use crate::ExtractError;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Base directory for extracted data when neither the run config nor the
/// environment names one.
pub const DEFAULT_DATA_ROOT: &str = "./storage/data-extract";
pub const DATA_ROOT_ENV: &str = "CPQ_DATA_DIR";
pub const SETTINGS_ENV: &str = "CPQ_SETTINGS";

/// Inclusive calendar-day range. Either bound may be missing, in which case
/// the filter is not applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start: Some(start), end: Some(end) }
    }

    /// Both bounds, when the range is complete.
    pub fn bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }
}

impl TryFrom<Vec<String>> for DateRange {
    type Error = String;

    fn try_from(raw: Vec<String>) -> Result<Self, Self::Error> {
        if raw.len() > 2 {
            return Err(format!("date range takes at most two dates, got {}", raw.len()));
        }
        let parse = |s: Option<&String>| -> Result<Option<NaiveDate>, String> {
            match s.map(|s| s.trim()) {
                None | Some("") => Ok(None),
                Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(Some)
                    .map_err(|e| format!("invalid date '{}': {}", s, e)),
            }
        };
        Ok(Self { start: parse(raw.first())?, end: parse(raw.get(1))? })
    }
}

impl From<DateRange> for Vec<String> {
    fn from(range: DateRange) -> Self {
        let fmt = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
        vec![fmt(range.start), fmt(range.end)]
    }
}

/// Per-object filter and field selection. Accepts the PascalCase keys the
/// comparison UI historically produced as well as camelCase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectConfig {
    #[serde(default, alias = "Fields")]
    pub fields: Vec<String>,
    #[serde(default, alias = "ForeignKey", skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(default, alias = "ActiveCondition", skip_serializing_if = "Option::is_none")]
    pub active_condition: Option<String>,
    #[serde(default, alias = "LastModifiedBetween", skip_serializing_if = "Option::is_none")]
    pub last_modified_between: Option<DateRange>,
    #[serde(default, alias = "CreatedBetween", skip_serializing_if = "Option::is_none")]
    pub created_between: Option<DateRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrgEntry {
    Username(String),
    Detailed { username: String },
}

impl OrgEntry {
    pub fn username(&self) -> &str {
        match self {
            OrgEntry::Username(u) => u,
            OrgEntry::Detailed { username } => username,
        }
    }
}

/// Where fetchers read records from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceSpec {
    /// Salesforce CLI (`sf api request graphql`).
    SfCli {
        #[serde(default = "default_sf_program")]
        program: String,
    },
    /// Recorded GraphQL responses, `<dir>/<org>/<object>.json`.
    Fixture { dir: PathBuf },
}

fn default_sf_program() -> String {
    "sf".to_string()
}

impl Default for SourceSpec {
    fn default() -> Self {
        SourceSpec::SfCli { program: default_sf_program() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub orgs: Vec<OrgEntry>,
    #[serde(deserialize_with = "ordered_objects")]
    pub objects: Vec<(String, ObjectConfig)>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub source: SourceSpec,
}

// Objects keep the order they were written in, so shard assignment is stable.
fn ordered_objects<'de, D>(deserializer: D) -> Result<Vec<(String, ObjectConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
    map.into_iter()
        .map(|(name, value)| {
            serde_json::from_value::<ObjectConfig>(value)
                .map(|config| (name.clone(), config))
                .map_err(|e| serde::de::Error::custom(format!("object {}: {}", name, e)))
        })
        .collect()
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let text = fs::read_to_string(path).map_err(|e| {
            ExtractError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ExtractError> {
        let config: RunConfig = serde_json::from_str(text)
            .map_err(|e| ExtractError::Config(format!("invalid run config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.orgs.is_empty() {
            return Err(ExtractError::Config("at least one org is required".to_string()));
        }
        if self.objects.is_empty() {
            return Err(ExtractError::Config("at least one object is required".to_string()));
        }
        if let Some(blank) = self.orgs.iter().find(|o| o.username().trim().is_empty()) {
            return Err(ExtractError::Config(format!("blank org identifier: {:?}", blank)));
        }
        let mut seen = std::collections::HashSet::new();
        for org in &self.orgs {
            if !seen.insert(crate::layout::sanitize(org.username())) {
                return Err(ExtractError::Config(format!("duplicate org: {}", org.username())));
            }
        }
        for (name, _) in &self.objects {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ExtractError::Config(format!("invalid object name: '{}'", name)));
            }
        }
        Ok(())
    }

    pub fn org_usernames(&self) -> Vec<String> {
        self.orgs.iter().map(|o| o.username().to_string()).collect()
    }

    /// Data directory for one comparison run: the configured `dataDir`, or
    /// `<root>/<comparison_id>` where root comes from `CPQ_DATA_DIR`.
    pub fn data_dir_for(&self, comparison_id: &str) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        let root = std::env::var(DATA_ROOT_ENV).unwrap_or_else(|_| DEFAULT_DATA_ROOT.to_string());
        PathBuf::from(root).join(comparison_id)
    }
}

/// Settings shared with the hosting tool (the editor extension writes these).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub max_concurrent_workers: Option<usize>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let text = fs::read_to_string(path).map_err(|e| {
            ExtractError::Config(format!("cannot read settings {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| ExtractError::Config(format!("invalid settings {}: {}", path.display(), e)))
    }

    /// Load from an explicit path, else from `CPQ_SETTINGS`, else empty.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ExtractError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var(SETTINGS_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }
}
