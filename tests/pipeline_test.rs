use cpq_extract::config::RunConfig;
use cpq_extract::launcher::{ProcessLauncher, WorkerBinaries};
use cpq_extract::layout::{self, RunLayout};
use cpq_extract::orchestrator::{FetchOrchestrator, OrchestratorOptions};
use cpq_extract::protocol::{parse_child_line, read_json_line, write_json_line, AppendAck, AppendRequest, ChildMessage};
use cpq_extract::ExtractError;
use serde_json::{json, Value};
use std::fs;
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

fn binaries() -> WorkerBinaries {
    WorkerBinaries {
        writer: env!("CARGO_BIN_EXE_buffer_writer").into(),
        fetcher: env!("CARGO_BIN_EXE_org_fetcher").into(),
    }
}

fn options() -> OrchestratorOptions {
    OrchestratorOptions {
        drain_poll_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(20),
        writer_grace: Duration::from_secs(5),
        ..OrchestratorOptions::default()
    }
}

/// Recorded responses: `pages` pages of `per_page` records each.
fn write_fixture(dir: &Path, org_dir: &str, object: &str, pages: usize, per_page: usize) {
    let responses: Vec<Value> = (0..pages)
        .map(|p| {
            let edges: Vec<Value> = (0..per_page)
                .map(|i| {
                    json!({"node": {
                        "Id": format!("{}-{}-{}", object, p, i),
                        "Name": {"value": format!("{} {}", object, i)},
                        "LastModifiedDate": {"value": "2024-02-01T10:00:00.000+0000"},
                        "CreatedBy": {"Name": {"value": "Admin"}}
                    }})
                })
                .collect();
            let next = if p + 1 < pages { Some((p + 1).to_string()) } else { None };
            json!({"data": {"uiapi": {"query": {object: {
                "edges": edges,
                "pageInfo": {"hasNextPage": next.is_some(), "endCursor": next}
            }}}}})
        })
        .collect();
    let org = dir.join(org_dir);
    fs::create_dir_all(&org).unwrap();
    fs::write(org.join(format!("{}.json", object)), Value::Array(responses).to_string()).unwrap();
}

fn run_config(data_dir: &Path, fixtures: &Path, orgs: &[&str], objects: &[&str]) -> RunConfig {
    let objects: serde_json::Map<String, Value> = objects
        .iter()
        .map(|o| (o.to_string(), json!({"Fields": ["Name"], "foreignKey": "Name"})))
        .collect();
    let config = json!({
        "orgs": orgs,
        "objects": objects,
        "dataDir": data_dir,
        "source": {"kind": "fixture", "dir": fixtures}
    });
    RunConfig::from_json(&config.to_string()).unwrap()
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).unwrap().lines().count()
}

#[test]
fn test_full_run_writes_every_object_for_every_org() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixtures = temp_dir.path().join("fixtures");
    let data_dir = temp_dir.path().join("data");
    for org in ["dev_example_com", "qa_example_com"] {
        write_fixture(&fixtures, org, "Account", 3, 200);
        write_fixture(&fixtures, org, "SBQQ__Quote__c", 2, 50);
        write_fixture(&fixtures, org, "Product2", 1, 7);
    }
    let config = run_config(
        &data_dir,
        &fixtures,
        &["dev@example.com", "qa@example.com"],
        &["Account", "SBQQ__Quote__c", "Product2"],
    );

    let mut orchestrator = FetchOrchestrator::new(ProcessLauncher::new(binaries()), options());
    let summary = orchestrator.run(&config, "cmp-1", Some(4)).unwrap();
    assert_eq!(summary.fetcher_count, 4);
    assert_eq!(summary.org_count, 2);
    assert_eq!(summary.object_count, 3);
    assert_eq!(summary.total_records, 2 * (600 + 100 + 7));

    let layout = RunLayout::new(&data_dir);
    assert!(layout::is_drained(&layout.buffer_dir()).unwrap());
    for org in ["dev_example_com", "qa_example_com"] {
        assert_eq!(line_count(&layout.target_path(org, "Account")), 600);
        assert_eq!(line_count(&layout.target_path(org, "SBQQ__Quote__c")), 100);
        assert_eq!(line_count(&layout.target_path(org, "Product2")), 7);
    }

    let first: Value = serde_json::from_str(
        fs::read_to_string(layout.target_path("qa_example_com", "Product2")).unwrap().lines().next().unwrap(),
    )
    .unwrap();
    assert_eq!(first["_sourceOrg"], "qa@example.com");
    assert_eq!(first["_objectName"], "Product2");
    assert_eq!(first["CreatedBy.Name"], "Admin");
}

#[test]
fn test_one_broken_org_is_reported_and_the_rest_is_kept() {
    let temp_dir = tempfile::tempdir().unwrap();
    let fixtures = temp_dir.path().join("fixtures");
    let data_dir = temp_dir.path().join("data");
    write_fixture(&fixtures, "good_example_com", "Account", 2, 10);
    write_fixture(&fixtures, "good_example_com", "Contact", 1, 5);
    // The bad org has Contact but no Account.
    write_fixture(&fixtures, "bad_example_com", "Contact", 1, 5);
    let config = run_config(&data_dir, &fixtures, &["good@example.com", "bad@example.com"], &["Account", "Contact"]);

    let mut orchestrator = FetchOrchestrator::new(ProcessLauncher::new(binaries()), options());
    let err = orchestrator.run(&config, "cmp-2", Some(2)).unwrap_err();
    match err {
        ExtractError::FetchersFailed(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].org, "bad@example.com");
            assert!(failures[0].reason.contains("Account"), "{}", failures[0].reason);
        }
        other => panic!("unexpected error: {}", other),
    }

    let layout = RunLayout::new(&data_dir);
    assert!(layout::is_drained(&layout.buffer_dir()).unwrap());
    assert_eq!(line_count(&layout.target_path("good_example_com", "Account")), 20);
    assert_eq!(line_count(&layout.target_path("bad_example_com", "Contact")), 5);
    assert!(!layout.target_path("bad_example_com", "Account").exists());
}

#[test]
fn test_writer_process_announces_ready_and_exits_on_stdin_close() {
    let temp_dir = tempfile::tempdir().unwrap();
    let layout = RunLayout::new(temp_dir.path());
    // Leftover from an earlier crash, recovered before ready.
    layout.ensure_buffer_dir().unwrap();
    fs::write(layout.buffer_path("old_0", 0, "o", "Account"), "{\"Id\":\"old\"}\n").unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_buffer_writer"))
        .arg("--data-dir")
        .arg(temp_dir.path())
        .arg("--comparison-id")
        .arg("cmp")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    let mut line = String::new();
    stdout.read_line(&mut line).unwrap();
    let Some(ChildMessage::Ready { address }) = parse_child_line(&line) else {
        panic!("expected ready, got {:?}", line);
    };
    assert!(!layout.buffer_path("old_0", 0, "o", "Account").exists());

    let stream = TcpStream::connect(&address).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;
    let request = AppendRequest {
        fetcher_id: "o_0_0".to_string(),
        org: "o".to_string(),
        object: "Account".to_string(),
        page: 0,
        records: vec![json!({"Id": "new"})],
    };
    write_json_line(&mut writer, &request).unwrap();
    let ack: AppendAck = read_json_line(&mut reader).unwrap().unwrap();
    assert!(ack.ok);
    drop(writer);
    drop(reader);

    drop(child.stdin.take());
    let status = child.wait().unwrap();
    assert!(status.success());
    let text = fs::read_to_string(layout.target_path("o", "Account")).unwrap();
    assert_eq!(text, "{\"Id\":\"old\"}\n{\"Id\":\"new\"}\n");
    assert!(layout::is_drained(&layout.buffer_dir()).unwrap());
}
