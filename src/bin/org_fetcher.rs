use cpq_extract::buffer_writer::WriterClient;
use cpq_extract::fetcher::OrgFetcher;
use cpq_extract::protocol::{emit, read_json_line, ChildMessage, FetcherPayload};
use cpq_extract::{source, ExtractError};
use dotenv::dotenv;
use std::io::BufReader;
use std::time::Duration;

const WRITER_TIMEOUT: Duration = Duration::from_secs(120);

fn read_payload() -> Result<FetcherPayload, ExtractError> {
    let stdin = std::io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    read_json_line(&mut reader)?.ok_or_else(|| ExtractError::Protocol("no job payload on stdin".to_string()))
}

fn run() -> Result<bool, ExtractError> {
    let payload = read_payload()?;
    let mut source = source::from_spec(&payload.source);
    let mut writer = WriterClient::connect(&payload.writer_address, WRITER_TIMEOUT)?;
    let summary = OrgFetcher::new(&payload.job, source.as_mut(), &mut writer).run(&mut |message: ChildMessage| {
        if let Err(e) = emit(&message) {
            tracing::warn!(error = %e, "cannot report to orchestrator");
        }
    });
    tracing::info!(
        fetcher_id = %payload.job.fetcher_id,
        org = %payload.job.org,
        records = summary.total_records(),
        failed_objects = summary.failed_objects().len(),
        "fetcher finished"
    );
    Ok(summary.is_success())
}

fn main() {
    dotenv().ok();
    cpq_extract::init_tracing("org_fetcher");
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = %e, "fetcher failed");
            std::process::exit(1);
        }
    }
}
