mod common;

use std::collections::HashSet;
use std::time::Duration;

use bulk_transfer::{BulkTransferError, JobIdentity, JobLedger};
use common::*;
use more_asserts::assert_gt;
use transfer_client::{FailureKind, FileSelection, TransferDirection};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batches_and_ledger_rows_for_120_files() {
    let fx = Fixture::with_remote_files(120, |i| 500 + (i % 7) * 300).await;
    let config = fx.config(TransferDirection::Download).with_num_workers(8).with_batch_size(50);

    let summary = fx.engine(config).run().await.unwrap();

    assert_eq!(fx.metadata.issue_calls(), vec![50, 50, 20]);
    assert_eq!(summary.requested, 120);
    assert_eq!(summary.succeeded, 120);
    assert_eq!(summary.failed, 0);
    assert!(summary.retry_hint.is_none());

    let rows = ledger_rows(fx.ledger.path(), &summary.job_id);
    assert_eq!(rows.len(), 120);
    assert!(rows.iter().all(|r| r.actual_size > 0 && r.actual_size == r.expected_size));
    let ids: HashSet<_> = rows.iter().map(|r| r.file_id.as_str()).collect();
    assert_eq!(ids.len(), 120);

    for (i, file) in fx.files.iter().enumerate() {
        let data = tokio::fs::read(fx.local_path(file)).await.unwrap();
        assert_eq!(data, payload(i, file.expected_size as usize));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rerun_of_completed_job_enumerates_nothing() {
    let fx = Fixture::with_remote_files(30, |_| 2048).await;
    let first = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();
    let served = fx.store.bytes_served();
    let issue_calls = fx.metadata.issue_calls().len();

    let second = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();

    assert_eq!(second.job_id, first.job_id);
    assert_eq!(second.requested, 0);
    assert_eq!(second.previously_completed, 30);
    assert_eq!(fx.store.bytes_served(), served);
    assert_eq!(fx.metadata.issue_calls().len(), issue_calls);
    assert_eq!(ledger_rows(fx.ledger.path(), &first.job_id).len(), 30);
}

#[tokio::test]
async fn test_files_already_on_disk_are_skipped_without_transfer() {
    let fx = Fixture::with_remote_files(10, |i| 100 * (i + 1)).await;
    for (i, file) in fx.files.iter().enumerate() {
        let path = fx.local_path(file);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, payload(i, file.expected_size as usize)).await.unwrap();
    }

    let summary = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();

    assert_eq!(fx.store.bytes_served(), 0);
    assert!(fx.store.range_starts().is_empty());
    assert_eq!(summary.skipped, 10);
    assert_eq!(summary.succeeded, 0);
    let rows = ledger_rows(fx.ledger.path(), &summary.job_id);
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|r| r.exists));
}

#[tokio::test]
async fn test_partial_download_resumes_from_its_length() {
    let fx = Fixture::with_remote_files(1, |_| 300_000).await;
    let file = &fx.files[0];
    let full = payload(0, 300_000);
    let final_path = fx.local_path(file);
    let partial_path = final_path.with_file_name(format!(
        "{}.partial",
        final_path.file_name().unwrap().to_string_lossy()
    ));
    tokio::fs::create_dir_all(final_path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&partial_path, &full[..123_456]).await.unwrap();

    let summary = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(fx.store.range_starts(), vec![(file.locator.clone(), 123_456)]);
    assert_eq!(fx.store.bytes_served(), 300_000 - 123_456);
    assert_eq!(tokio::fs::read(&final_path).await.unwrap(), full);
    assert!(!partial_path.exists());

    let rows = ledger_rows(fx.ledger.path(), &summary.job_id);
    assert_eq!(rows[0].checksum, transfer_client::checksum::compute_checksum(&full));
}

#[tokio::test]
async fn test_expired_credentials_are_refreshed_once() {
    let fx = Fixture::with_remote_files(5, |_| 4096).await;
    let target = &fx.files[2];
    fx.store.inject_expiry(&target.locator, 1);

    let summary = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();

    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 0);
    assert_eq!(fx.metadata.issued_count(&target.file_id), 2);
    assert_eq!(fx.metadata.issued_count(&fx.files[0].file_id), 1);
    assert!(fx.local_path(target).exists());
}

#[tokio::test]
async fn test_repeated_expiry_fails_the_file_and_manifest_retries_it() {
    let fx = Fixture::with_remote_files(6, |_| 1000).await;
    let target = fx.files[4].clone();
    fx.store.inject_expiry(&target.locator, 1);
    fx.store.inject_expiry(&target.locator, 2);

    let summary = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();

    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 1);
    assert_eq!(fx.metadata.issued_count(&target.file_id), 2);
    assert!(summary.retry_hint.is_some());
    assert_eq!(manifest_lines(&summary.manifest_path), vec![target.locator.to_string()]);
    assert!(!fx.local_path(&target).exists());

    let retry_selection = FileSelection::from_manifest(&summary.manifest_path).unwrap();
    let mut config = fx.config(TransferDirection::Download);
    config.selection = retry_selection;
    let retry = fx.engine(config).run().await.unwrap();

    assert_ne!(retry.job_id, summary.job_id);
    assert_eq!(retry.requested, 1);
    assert_eq!(retry.succeeded, 1);
    assert!(fx.local_path(&target).exists());
}

#[tokio::test]
async fn test_missing_object_is_a_per_file_failure() {
    let fx = Fixture::with_remote_files(4, |_| 512).await;
    let ghost = descriptor(99, 512);
    fx.metadata.add_file(COLLECTION, &[], ghost.clone());

    let summary = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();

    assert_eq!(summary.requested, 5);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(manifest_lines(&summary.manifest_path), vec![ghost.locator.to_string()]);
    let rows = ledger_rows(fx.ledger.path(), &summary.job_id);
    assert!(rows.iter().all(|r| r.file_id != ghost.file_id));
}

#[tokio::test]
async fn test_unresponsive_metadata_service_stops_the_run() {
    let fx = Fixture::with_remote_files(3, |_| 10).await;
    fx.metadata.set_unresponsive(true);

    let err = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap_err();

    assert!(matches!(err, BulkTransferError::InfrastructureUnresponsive(_)), "{err:?}");
    assert_eq!(err.kind(), FailureKind::InfrastructureUnresponsive);
    assert_eq!(fx.store.bytes_served(), 0);
}

#[tokio::test]
async fn test_empty_file_is_recorded() {
    let fx = Fixture::with_remote_files(3, |i| if i == 1 { 0 } else { 64 }).await;

    let summary = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();

    assert_eq!(summary.succeeded, 3);
    let rows = ledger_rows(fx.ledger.path(), &summary.job_id);
    assert_eq!(rows.len(), 3);
    let empty = rows.iter().find(|r| r.file_id == fx.files[1].file_id).unwrap();
    assert_eq!(empty.actual_size, 0);
    assert_eq!(tokio::fs::metadata(fx.local_path(&fx.files[1])).await.unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_write_one_row_each() {
    let fx = Fixture::with_remote_files(200, |i| 1 + i * 13).await;
    let config = fx.config(TransferDirection::Download).with_num_workers(16).with_batch_size(25);

    let summary = fx.engine(config).run().await.unwrap();

    assert_eq!(summary.succeeded, 200);
    let rows = ledger_rows(fx.ledger.path(), &summary.job_id);
    assert_eq!(rows.len(), 200);
    let ids: HashSet<_> = rows.iter().map(|r| r.file_id.clone()).collect();
    assert_eq!(ids.len(), 200);
    assert_gt!(summary.bytes_transferred, 0);
}

#[tokio::test]
async fn test_name_filter_limits_the_selection() {
    let fx = Fixture::with_remote_files(9, |_| 32).await;
    let config = fx.config(TransferDirection::Download).with_name_filter(r"part_0/");

    let summary = fx.engine(config).run().await.unwrap();

    assert_eq!(summary.requested, 3);
    for (i, file) in fx.files.iter().enumerate() {
        assert_eq!(fx.local_path(file).exists(), i % 3 == 0, "{}", file.alias);
    }
}

#[tokio::test]
async fn test_verify_reports_missing_and_short_files() {
    let fx = Fixture::with_remote_files(5, |_| 1000).await;
    let first = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();
    let served = fx.store.bytes_served();

    tokio::fs::remove_file(fx.local_path(&fx.files[0])).await.unwrap();
    tokio::fs::write(fx.local_path(&fx.files[3]), b"short").await.unwrap();

    let summary = fx.engine(fx.config(TransferDirection::Download)).verify().await.unwrap();

    assert_eq!(summary.job_id, first.job_id);
    assert_eq!(summary.requested, 5);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 2);
    assert_eq!(fx.store.bytes_served(), served);

    let mut listed = manifest_lines(&summary.manifest_path);
    listed.sort();
    let mut expected = vec![fx.files[0].locator.to_string(), fx.files[3].locator.to_string()];
    expected.sort();
    assert_eq!(listed, expected);

    // Verification writes nothing to the ledger.
    assert_eq!(ledger_rows(fx.ledger.path(), &first.job_id).len(), 5);
}

#[derive(Debug, Default)]
struct CollectingReporter {
    reports: std::sync::Mutex<Vec<progress_tracking::ProgressReport>>,
}

#[async_trait::async_trait]
impl progress_tracking::ProgressReporter for CollectingReporter {
    async fn register_report(&self, report: progress_tracking::ProgressReport) {
        self.reports.lock().unwrap().push(report);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_is_reported_every_n_files() {
    let fx = Fixture::with_remote_files(30, |_| 100).await;
    let reporter = std::sync::Arc::new(CollectingReporter::default());
    let config = fx.config(TransferDirection::Download).with_report_interval(10);

    fx.engine(config).with_progress_reporter(reporter.clone()).run().await.unwrap();

    let reports = reporter.reports.lock().unwrap().clone();
    assert_eq!(reports.iter().filter(|r| !r.is_final).count(), 3);
    let last = reports.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.files_completed, 30);
    assert_eq!(last.files_total, 30);
    assert_eq!(last.bytes_completed, 3000);
}

#[tokio::test]
async fn test_cancelled_run_transfers_nothing() {
    let fx = Fixture::with_remote_files(5, |_| 100).await;
    let engine = fx.engine(fx.config(TransferDirection::Download));
    engine.cancellation_token().cancel();

    let err = engine.run().await.unwrap_err();

    assert!(matches!(err, BulkTransferError::Cancelled));
    assert_eq!(fx.store.bytes_served(), 0);
}

#[tokio::test]
async fn test_rows_appended_after_a_torn_row_survive_the_next_run() {
    let fx = Fixture::with_remote_files(3, |_| 100).await;
    let first = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();
    let report = fx.ledger.path().join(format!("{}_progress_report.csv", first.job_id));
    let mut contents = std::fs::read(&report).unwrap();
    contents.extend_from_slice(b"torn,s3://managed/x,fal");
    std::fs::write(&report, contents).unwrap();

    let extra = descriptor(3, 100);
    fx.store.insert_object(extra.locator.clone(), payload(3, 100)).await;
    fx.metadata.add_file(COLLECTION, &[], extra.clone());
    let second = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();
    assert_eq!(second.succeeded, 1);

    let third = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();
    assert_eq!(third.requested, 0);
    assert_eq!(third.previously_completed, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_lets_in_flight_files_finish() {
    let fx = Fixture::with_remote_files(4, |_| 1000).await;
    fx.store.set_api_delay(Duration::from_millis(500));
    let config = fx.config(TransferDirection::Download).with_num_workers(4);
    let engine = fx.engine(config.clone());
    let cancel = engine.cancellation_token();

    let run = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();
    let err = run.await.unwrap().unwrap_err();

    assert!(matches!(err, BulkTransferError::Cancelled));
    for (i, file) in fx.files.iter().enumerate() {
        let data = tokio::fs::read(fx.local_path(file)).await.unwrap();
        assert_eq!(data, payload(i, 1000));
    }
    let ledger = JobLedger::open(fx.ledger.path(), &JobIdentity::from_config(&config)).unwrap();
    assert_eq!(ledger.completed().len(), 4);
}

#[tokio::test]
async fn test_withheld_credentials_fail_only_that_file_as_forbidden() {
    let fx = Fixture::with_remote_files(6, |_| 100).await;
    let withheld = fx.files[2].clone();
    fx.metadata.withhold(&withheld.file_id);

    let summary = fx.engine(fx.config(TransferDirection::Download)).run().await.unwrap();

    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 1);
    // One batch request; the withheld file is not asked about again.
    assert_eq!(fx.metadata.issue_calls(), vec![6]);
    assert_eq!(fx.store.request_count(&withheld.locator), 0);
    assert_eq!(manifest_lines(&summary.manifest_path), vec![withheld.locator.to_string()]);
}
