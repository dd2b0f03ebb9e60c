//! One org, a shard of its objects: page through each object, filter and
//! decorate records, and hand every page to the buffer writer.

use crate::buffer_writer::WriterClient;
use crate::plan::FetchJob;
use crate::protocol::{AppendRequest, ChildMessage, FetchProgress};
use crate::query::{decorate, parse_page, QueryPlan, RecordFilter};
use crate::source::RecordSource;
use crate::ExtractError;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Where fetched pages go. Returns the staged buffer name once accepted.
pub trait PageSinkLike {
    fn append(&mut self, request: &AppendRequest) -> Result<String, ExtractError>;
}

impl PageSinkLike for WriterClient {
    fn append(&mut self, request: &AppendRequest) -> Result<String, ExtractError> {
        WriterClient::append(self, request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectOutcome {
    pub object: String,
    pub records: usize,
    pub pages: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub objects: Vec<ObjectOutcome>,
}

impl FetchSummary {
    pub fn total_records(&self) -> usize {
        self.objects.iter().map(|o| o.records).sum()
    }

    pub fn failed_objects(&self) -> Vec<&ObjectOutcome> {
        self.objects.iter().filter(|o| o.error.is_some()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.objects.iter().all(|o| o.error.is_none())
    }
}

pub struct OrgFetcher<'a> {
    job: &'a FetchJob,
    source: &'a mut dyn RecordSource,
    sink: &'a mut dyn PageSinkLike,
}

impl<'a> OrgFetcher<'a> {
    pub fn new(job: &'a FetchJob, source: &'a mut dyn RecordSource, sink: &'a mut dyn PageSinkLike) -> Self {
        Self { job, source, sink }
    }

    /// Fetch every object of the job. A failing object is reported and the
    /// remaining objects still run.
    pub fn run(&mut self, report: &mut dyn FnMut(ChildMessage)) -> FetchSummary {
        info!(
            fetcher_id = %self.job.fetcher_id,
            org = %self.job.org,
            objects = self.job.objects.len(),
            "fetcher starting"
        );
        let mut summary = FetchSummary::default();
        for (index, spec) in self.job.objects.iter().enumerate() {
            let buffer_id = format!("{}_{}", self.job.fetcher_id, index);
            let mut outcome = ObjectOutcome {
                object: spec.name.clone(),
                records: 0,
                pages: 0,
                error: None,
            };
            if let Err(e) = self.fetch_object(&buffer_id, &spec.name, &spec.config, &mut outcome, report) {
                error!(org = %self.job.org, object = %spec.name, page = outcome.pages, error = %e, "error during fetch");
                report(ChildMessage::FetchError {
                    org: self.job.org.clone(),
                    object: spec.name.clone(),
                    error: e.to_string(),
                });
                outcome.error = Some(e.to_string());
            } else {
                info!(org = %self.job.org, object = %spec.name, total_records = outcome.records, "object fetch completed");
                report(ChildMessage::ObjectDone {
                    org: self.job.org.clone(),
                    object: spec.name.clone(),
                    total_records: outcome.records,
                    pages: outcome.pages,
                });
            }
            summary.objects.push(outcome);
        }
        summary
    }

    fn fetch_object(
        &mut self,
        buffer_id: &str,
        object: &str,
        config: &crate::config::ObjectConfig,
        outcome: &mut ObjectOutcome,
        report: &mut dyn FnMut(ChildMessage),
    ) -> Result<(), ExtractError> {
        let plan = QueryPlan::from_config(object, config)?;
        let filter = RecordFilter::from_config(config)?;
        let org = self.job.org.as_str();
        let mut cursor: Option<String> = None;

        loop {
            let response = self.source.fetch(org, &plan, cursor.as_deref())?;
            let Some(page) = parse_page(&response, object)? else {
                warn!(org, object, "no data returned from GraphQL");
                return Ok(());
            };

            let fetched_at = Utc::now();
            let received = page.records.len();
            let records: Vec<Value> = page
                .records
                .into_iter()
                .filter(|r| filter.is_noop() || filter.matches(r))
                .enumerate()
                .map(|(i, mut record)| {
                    decorate(&mut record, org, object, outcome.records + i, &fetched_at);
                    Value::Object(record)
                })
                .collect();
            let kept = records.len();
            if kept < received {
                debug!(object, received, kept, "client-side filters dropped records");
            }

            if !records.is_empty() {
                let request = AppendRequest {
                    fetcher_id: buffer_id.to_string(),
                    org: org.to_string(),
                    object: object.to_string(),
                    page: outcome.pages,
                    records,
                };
                let buffer_file = self.sink.append(&request)?;
                debug!(object, page = outcome.pages, buffer_file, "page handed to writer");
            }

            outcome.records += kept;
            outcome.pages += 1;
            let next = if page.has_next_page { page.end_cursor } else { None };
            report(ChildMessage::Progress(FetchProgress {
                org: org.to_string(),
                object: object.to_string(),
                page: outcome.pages,
                records_in_page: kept,
                total_records: outcome.records,
                has_next_page: next.is_some(),
            }));

            match next {
                Some(c) if cursor.as_deref() == Some(c.as_str()) => {
                    return Err(ExtractError::Upstream(format!("cursor did not advance past {}", c)));
                }
                Some(c) => cursor = Some(c),
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DateRange, ObjectConfig};
    use crate::plan::ObjectSpec;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::HashMap;

    struct ScriptedSource {
        pages: HashMap<String, Vec<Value>>,
    }

    impl RecordSource for ScriptedSource {
        fn fetch(&mut self, _org: &str, plan: &QueryPlan, cursor: Option<&str>) -> Result<Value, ExtractError> {
            let pages = self
                .pages
                .get(&plan.object)
                .ok_or_else(|| ExtractError::Upstream(format!("no such object {}", plan.object)))?;
            let index = cursor.map(|c| c.parse::<usize>().unwrap()).unwrap_or(0);
            Ok(pages[index].clone())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        requests: Vec<AppendRequest>,
    }

    impl PageSinkLike for CollectingSink {
        fn append(&mut self, request: &AppendRequest) -> Result<String, ExtractError> {
            self.requests.push(request.clone());
            Ok(format!("{}_page{}", request.fetcher_id, request.page))
        }
    }

    fn response(object: &str, nodes: Vec<Value>, next: Option<&str>) -> Value {
        json!({
            "data": {"uiapi": {"query": {object: {
                "edges": nodes.into_iter().map(|n| json!({"node": n})).collect::<Vec<_>>(),
                "pageInfo": {"hasNextPage": next.is_some(), "endCursor": next}
            }}}}
        })
    }

    fn node(id: &str, modified: &str) -> Value {
        json!({"Id": id, "LastModifiedDate": {"value": modified}, "Name": {"value": id}})
    }

    fn job(objects: Vec<(&str, ObjectConfig)>) -> FetchJob {
        FetchJob {
            fetcher_id: "dev_x_com_0".to_string(),
            org: "dev@x.com".to_string(),
            shard_index: 0,
            comparison_id: "cmp".to_string(),
            objects: objects
                .into_iter()
                .map(|(name, config)| ObjectSpec { name: name.to_string(), config })
                .collect(),
        }
    }

    #[test]
    fn test_pages_follow_cursor_and_decorate() {
        let mut source = ScriptedSource {
            pages: HashMap::from([(
                "Account".to_string(),
                vec![
                    response("Account", vec![node("a1", "2024-01-01T00:00:00Z"), node("a2", "2024-01-01T00:00:00Z")], Some("1")),
                    response("Account", vec![node("a3", "2024-01-01T00:00:00Z")], None),
                ],
            )]),
        };
        let mut sink = CollectingSink::default();
        let job = job(vec![("Account", ObjectConfig::default())]);
        let mut messages = Vec::new();
        let summary = OrgFetcher::new(&job, &mut source, &mut sink).run(&mut |m: ChildMessage| messages.push(m));

        assert!(summary.is_success());
        assert_eq!(summary.total_records(), 3);
        assert_eq!(sink.requests.len(), 2);
        assert_eq!(sink.requests[0].fetcher_id, "dev_x_com_0_0");
        assert_eq!(sink.requests[1].page, 1);
        let third = &sink.requests[1].records[0];
        assert_eq!(third["Id"], "a3");
        assert_eq!(third["_recordIndex"], 2);
        assert_eq!(third["_sourceOrg"], "dev@x.com");
        assert_eq!(third["_objectName"], "Account");
        assert!(matches!(messages.last(), Some(ChildMessage::ObjectDone { total_records: 3, pages: 2, .. })));
    }

    #[test]
    fn test_failing_object_does_not_stop_the_rest() {
        let mut source = ScriptedSource {
            pages: HashMap::from([(
                "Quote__c".to_string(),
                vec![response("Quote__c", vec![node("q1", "2024-01-01T00:00:00Z")], None)],
            )]),
        };
        let mut sink = CollectingSink::default();
        let job = job(vec![("Missing", ObjectConfig::default()), ("Quote__c", ObjectConfig::default())]);
        let mut messages = Vec::new();
        let summary = OrgFetcher::new(&job, &mut source, &mut sink).run(&mut |m: ChildMessage| messages.push(m));

        assert!(!summary.is_success());
        assert_eq!(summary.failed_objects().len(), 1);
        assert_eq!(summary.failed_objects()[0].object, "Missing");
        assert_eq!(summary.total_records(), 1);
        assert!(matches!(&messages[0], ChildMessage::FetchError { object, .. } if object == "Missing"));
        assert_eq!(sink.requests[0].fetcher_id, "dev_x_com_0_1");
    }

    #[test]
    fn test_date_window_drops_records_and_skips_empty_pages() {
        let mut config = ObjectConfig::default();
        config.last_modified_between = Some(DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        ));
        let mut source = ScriptedSource {
            pages: HashMap::from([(
                "Account".to_string(),
                vec![
                    response("Account", vec![node("old", "2023-12-31T10:00:00Z")], Some("1")),
                    response("Account", vec![node("in", "2024-03-31T23:00:00Z"), node("late", "2024-04-01T00:00:00Z")], None),
                ],
            )]),
        };
        let mut sink = CollectingSink::default();
        let job = job(vec![("Account", config)]);
        let summary = OrgFetcher::new(&job, &mut source, &mut sink).run(&mut |_: ChildMessage| {});

        assert_eq!(summary.total_records(), 1);
        assert_eq!(sink.requests.len(), 1);
        assert_eq!(sink.requests[0].page, 1);
        assert_eq!(sink.requests[0].records[0]["Id"], "in");
        assert_eq!(sink.requests[0].records[0]["_recordIndex"], 0);
    }

    #[test]
    fn test_missing_data_ends_object_quietly() {
        let mut source = ScriptedSource {
            pages: HashMap::from([("Account".to_string(), vec![json!({"data": {"uiapi": {"query": {}}}})])]),
        };
        let mut sink = CollectingSink::default();
        let job = job(vec![("Account", ObjectConfig::default())]);
        let summary = OrgFetcher::new(&job, &mut source, &mut sink).run(&mut |_: ChildMessage| {});
        assert!(summary.is_success());
        assert_eq!(summary.total_records(), 0);
        assert!(sink.requests.is_empty());
    }

    #[test]
    fn test_stuck_cursor_is_an_error() {
        let mut source = ScriptedSource {
            pages: HashMap::from([(
                "Account".to_string(),
                vec![
                    response("Account", vec![node("a", "2024-01-01T00:00:00Z")], Some("1")),
                    response("Account", vec![node("b", "2024-01-01T00:00:00Z")], Some("1")),
                ],
            )]),
        };
        let mut sink = CollectingSink::default();
        let job = job(vec![("Account", ObjectConfig::default())]);
        let summary = OrgFetcher::new(&job, &mut source, &mut sink).run(&mut |_: ChildMessage| {});
        assert!(!summary.is_success());
        assert_eq!(summary.objects[0].records, 2);
    }
}
