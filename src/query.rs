//! GraphQL request shaping and response flattening for the UI API.

use crate::config::{DateRange, ObjectConfig};
use crate::ExtractError;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde_json::{Map, Value};

pub const PAGE_SIZE: usize = 200;

/// Always fetched so date filters and audit columns have data.
pub const SYSTEM_FIELDS: [&str; 3] = ["CreatedDate", "LastModifiedDate", "CreatedBy.Name"];

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Null,
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub field: String,
    pub op: CompareOp,
    pub value: Literal,
}

/// Conjunction of field comparisons, e.g. `IsActive = true AND Type != null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub clauses: Vec<Comparison>,
}

fn split_conjunction(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
            current.push(c);
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            in_quote = Some(c);
            current.push(c);
            i += 1;
            continue;
        }
        if c == '&' && chars.get(i + 1) == Some(&'&') {
            parts.push(std::mem::take(&mut current));
            i += 2;
            continue;
        }
        let at_word_start = i == 0 || chars[i - 1].is_whitespace();
        if at_word_start && i + 3 <= chars.len() {
            let word: String = chars[i..i + 3].iter().collect();
            let word_ends = chars.get(i + 3).is_none_or(|c| c.is_whitespace());
            if word.eq_ignore_ascii_case("and") && word_ends {
                parts.push(std::mem::take(&mut current));
                i += 3;
                continue;
            }
        }
        current.push(c);
        i += 1;
    }
    parts.push(current);
    parts
}

fn parse_literal(raw: &str) -> Result<Literal, ExtractError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("true") {
        return Ok(Literal::Bool(true));
    }
    if raw.eq_ignore_ascii_case("false") {
        return Ok(Literal::Bool(false));
    }
    if raw.eq_ignore_ascii_case("null") {
        return Ok(Literal::Null);
    }
    for quote in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Ok(Literal::Text(raw[1..raw.len() - 1].to_string()));
        }
    }
    raw.parse::<f64>()
        .map(Literal::Number)
        .map_err(|_| ExtractError::Config(format!("unsupported condition value: {}", raw)))
}

fn parse_comparison(raw: &str) -> Result<Comparison, ExtractError> {
    let (field, op, value) = if let Some((l, r)) = raw.split_once("!=") {
        (l, CompareOp::Ne, r)
    } else if let Some((l, r)) = raw.split_once("==") {
        (l, CompareOp::Eq, r)
    } else if let Some((l, r)) = raw.split_once('=') {
        (l, CompareOp::Eq, r)
    } else {
        return Err(ExtractError::Config(format!("condition clause has no comparison: {}", raw.trim())));
    };
    let field = field.trim();
    if field.is_empty()
        || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ExtractError::Config(format!("invalid condition field: '{}'", field)));
    }
    Ok(Comparison { field: field.to_string(), op, value: parse_literal(value)? })
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ExtractError> {
        let clauses = split_conjunction(text)
            .iter()
            .map(|c| parse_comparison(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clauses })
    }

    /// GraphQL `where` body, without the enclosing braces.
    pub fn to_graphql(&self) -> String {
        self.clauses
            .iter()
            .map(|c| {
                let op = match c.op {
                    CompareOp::Eq => "eq",
                    CompareOp::Ne => "neq",
                };
                let value = match &c.value {
                    Literal::Bool(b) => b.to_string(),
                    Literal::Null => "null".to_string(),
                    Literal::Number(n) => n.to_string(),
                    Literal::Text(t) => format!("\"{}\"", escape_graphql(t)),
                };
                let segments: Vec<&str> = c.field.split('.').collect();
                let last = segments.len() - 1;
                let mut rendered = format!("{{ {}: {} }}", op, value);
                for (i, segment) in segments.iter().enumerate().rev() {
                    let name = match segment.strip_suffix("__c") {
                        Some(base) if i < last => format!("{}__r", base),
                        _ => segment.to_string(),
                    };
                    rendered = if i == 0 {
                        format!("{}: {}", name, rendered)
                    } else {
                        format!("{{ {}: {} }}", name, rendered)
                    };
                }
                rendered
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        self.clauses.iter().all(|c| {
            let actual = record
                .get(&c.field)
                .or_else(|| record.get(&flattened_key(&c.field)))
                .unwrap_or(&Value::Null);
            let equal = match &c.value {
                Literal::Null => actual.is_null(),
                Literal::Bool(b) => actual.as_bool() == Some(*b),
                Literal::Number(n) => actual.as_f64() == Some(*n),
                Literal::Text(t) => actual.as_str() == Some(t.as_str()),
            };
            match c.op {
                CompareOp::Eq => equal,
                CompareOp::Ne => !equal,
            }
        })
    }
}

/// Column name a relationship field gets after flattening: `A__c.B` is
/// returned as `A__r.B`.
fn flattened_key(field: &str) -> String {
    match field.split_once('.') {
        Some((parent, child)) => match parent.strip_suffix("__c") {
            Some(base) => format!("{}__r.{}", base, child),
            None => field.to_string(),
        },
        None => field.to_string(),
    }
}

fn escape_graphql(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

fn render_field(field: &str) -> String {
    match field.split_once('.') {
        Some((parent, child)) => {
            let parent = match parent.strip_suffix("__c") {
                Some(base) => format!("{}__r", base),
                None => parent.to_string(),
            };
            format!("{}{{{}{{value}}}}", parent, child)
        }
        None => format!("{}{{value}}", field),
    }
}

/// Query shape for one object; rendered once per page with its cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub object: String,
    pub fields: Vec<String>,
    pub condition: Option<Condition>,
    pub page_size: usize,
}

impl QueryPlan {
    pub fn from_config(object: &str, config: &ObjectConfig) -> Result<Self, ExtractError> {
        let mut fields: Vec<String> = Vec::new();
        let candidates = config
            .foreign_key
            .iter()
            .map(String::as_str)
            .chain(SYSTEM_FIELDS)
            .chain(config.fields.iter().map(String::as_str));
        for field in candidates {
            let field = field.trim();
            if field.is_empty() || field == "Id" || fields.iter().any(|f| f == field) {
                continue;
            }
            fields.push(field.to_string());
        }
        let condition = match config.active_condition.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(Condition::parse(text)?),
            _ => None,
        };
        // Condition fields are selected too, so the client-side check sees them.
        if let Some(condition) = &condition {
            for clause in &condition.clauses {
                if clause.field != "Id" && !fields.contains(&clause.field) {
                    fields.push(clause.field.clone());
                }
            }
        }
        Ok(Self { object: object.to_string(), fields, condition, page_size: PAGE_SIZE })
    }

    pub fn render(&self, cursor: Option<&str>) -> String {
        let mut args = vec![format!("first: {}", self.page_size)];
        if let Some(cursor) = cursor {
            args.push(format!("after: \"{}\"", escape_graphql(cursor)));
        }
        if let Some(condition) = &self.condition {
            args.push(format!("where: {{ {} }}", condition.to_graphql()));
        }
        let mut selection = vec!["Id".to_string()];
        selection.extend(self.fields.iter().map(|f| render_field(f)));
        format!(
            "{{uiapi{{query{{{}({}){{edges{{node{{{}}}}}pageInfo{{hasNextPage endCursor}}}}}}}}}}",
            self.object,
            args.join(", "),
            selection.join(" ")
        )
    }
}

/// One page of flattened records.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Map<String, Value>>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// `{F: {value}}` becomes `F`, `{R: {S: {value}}}` becomes `R.S`.
pub fn flatten_node(node: &Map<String, Value>) -> Map<String, Value> {
    let mut record = Map::new();
    let id = match node.get("Id") {
        Some(Value::Object(inner)) => inner.get("value").cloned().unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    record.insert("Id".to_string(), id);
    for (key, value) in node {
        if key == "Id" {
            continue;
        }
        let Value::Object(inner) = value else { continue };
        if let Some(v) = inner.get("value") {
            record.insert(key.clone(), v.clone());
            continue;
        }
        for (sub, sub_value) in inner {
            if let Some(v) = sub_value.as_object().and_then(|o| o.get("value")) {
                record.insert(format!("{}.{}", key, sub), v.clone());
            }
        }
    }
    record
}

/// Extract the page for `object` from a UI API response. `Ok(None)` when the
/// response carries no data for the object.
pub fn parse_page(response: &Value, object: &str) -> Result<Option<Page>, ExtractError> {
    if let Some(errors) = response.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| e.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string())
                .collect();
            return Err(ExtractError::Upstream(format!("GraphQL errors: {}", messages.join(", "))));
        }
    }
    let Some(data) = response.pointer(&format!("/data/uiapi/query/{}", object)) else {
        return Ok(None);
    };
    if data.is_null() {
        return Ok(None);
    }
    let records = data
        .get("edges")
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|edge| edge.get("node").and_then(Value::as_object))
                .map(flatten_node)
                .collect()
        })
        .unwrap_or_default();
    let page_info = data.get("pageInfo");
    let has_next_page = page_info
        .and_then(|p| p.get("hasNextPage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let end_cursor = page_info
        .and_then(|p| p.get("endCursor"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Some(Page { records, has_next_page, end_cursor }))
}

/// Audit columns added to every fetched record.
pub fn decorate(record: &mut Map<String, Value>, org: &str, object: &str, index: usize, fetched_at: &DateTime<Utc>) {
    record.insert("_sourceOrg".to_string(), Value::String(org.to_string()));
    record.insert("_objectName".to_string(), Value::String(object.to_string()));
    record.insert("_fetchTimestamp".to_string(), Value::String(fetched_at.to_rfc3339()));
    record.insert("_recordIndex".to_string(), Value::from(index));
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn day_window(start: NaiveDate, end: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let from = start.and_hms_opt(0, 0, 0)?.and_utc();
    let until = end.checked_add_days(Days::new(1))?.and_hms_opt(0, 0, 0)?.and_utc();
    Some((from, until))
}

/// Client-side filters that the query cannot express.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    foreign_key: Option<String>,
    last_modified: Option<(DateTime<Utc>, DateTime<Utc>)>,
    created: Option<(DateTime<Utc>, DateTime<Utc>)>,
    condition: Option<Condition>,
}

impl RecordFilter {
    pub fn from_config(config: &ObjectConfig) -> Result<Self, ExtractError> {
        let window = |range: &Option<DateRange>| {
            range.as_ref().and_then(DateRange::bounds).and_then(|(s, e)| day_window(s, e))
        };
        let condition = match config.active_condition.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(Condition::parse(text)?),
            _ => None,
        };
        Ok(Self {
            foreign_key: config
                .foreign_key
                .clone()
                .filter(|fk| !fk.trim().is_empty() && fk != "Id"),
            last_modified: window(&config.last_modified_between),
            created: window(&config.created_between),
            condition,
        })
    }

    pub fn is_noop(&self) -> bool {
        self.foreign_key.is_none()
            && self.last_modified.is_none()
            && self.created.is_none()
            && self.condition.is_none()
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        if let Some(fk) = &self.foreign_key {
            match record.get(fk) {
                None | Some(Value::Null) => return false,
                Some(Value::String(s)) if s.is_empty() => return false,
                _ => {}
            }
        }
        let within = |field: &str, window: &(DateTime<Utc>, DateTime<Utc>)| {
            record
                .get(field)
                .and_then(parse_timestamp)
                .is_some_and(|ts| ts >= window.0 && ts < window.1)
        };
        if let Some(window) = &self.last_modified {
            if !within("LastModifiedDate", window) {
                return false;
            }
        }
        if let Some(window) = &self.created {
            if !within("CreatedDate", window) {
                return false;
            }
        }
        self.condition.as_ref().is_none_or(|c| c.matches(record))
    }
}
