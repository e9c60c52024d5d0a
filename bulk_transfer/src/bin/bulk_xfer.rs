use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bulk_transfer::logging::{LoggingConfig, init_logging};
use bulk_transfer::{BulkTransferError, TransferConfig, TransferEngine, TransferSummary};
use clap::{Args, Parser, Subcommand};
use transfer_client::{
    Credentials, FileSelection, HttpMetadataService, HttpObjectStore, ObjectLocator, ObjectStore, RetryConfig,
    TransferDirection,
};

/// Exit code for runs stopped because a required service stopped responding.
const EXIT_INFRASTRUCTURE_UNRESPONSIVE: u8 = 2;

#[derive(Parser)]
#[clap(name = "bulk_xfer", version, about = "Resumable bulk transfers between object stores and local disk")]
struct Cli {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonArgs {
    /// Base URL of the metadata service.
    #[clap(long)]
    metadata_endpoint: String,
    /// Base URL of the managed object store.
    #[clap(long)]
    store_endpoint: String,
    /// Bearer token for the metadata service. Falls back to BULK_XFER_API_TOKEN.
    #[clap(long)]
    api_token: Option<String>,

    /// Transfer a whole collection.
    #[clap(long, group = "selection")]
    collection: Option<String>,
    /// Transfer a single named subset.
    #[clap(long, group = "selection")]
    subset: Option<String>,
    /// Transfer an explicit list of files; may be repeated.
    #[clap(long = "path", group = "selection")]
    paths: Vec<String>,
    /// Transfer the files listed in a retry manifest from an earlier run.
    #[clap(long, group = "selection")]
    file_list: Option<PathBuf>,

    /// Only transfer files whose relative path matches this regular expression.
    #[clap(long)]
    filter: Option<String>,
    /// Number of concurrent transfers.
    #[clap(short = 'n', long)]
    workers: Option<usize>,
    /// Files enumerated per batch.
    #[clap(long)]
    batch_size: Option<usize>,
    /// Where job state is kept.
    #[clap(long)]
    ledger_dir: Option<PathBuf>,
    /// Compare destination sizes with expectations without transferring.
    #[clap(long)]
    verify_only: bool,
    /// Log to the console instead of the log directory.
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Download files into a local directory.
    Download {
        /// Destination directory.
        destination: PathBuf,
    },
    /// Upload files from a local directory.
    Upload {
        /// Source directory.
        source: PathBuf,
    },
    /// Copy files into another object store.
    Copy(CopyArgs),
}

#[derive(Args)]
struct CopyArgs {
    /// Destination prefix, as s3://bucket/prefix.
    destination: String,
    /// Base URL of the destination store; defaults to the managed store.
    #[clap(long)]
    destination_endpoint: Option<String>,
    #[clap(long)]
    destination_access_key_id: String,
    #[clap(long)]
    destination_secret_access_key: String,
    #[clap(long)]
    destination_session_token: Option<String>,
}

impl CommonArgs {
    fn selection(&self) -> Result<FileSelection> {
        if let Some(collection) = &self.collection {
            Ok(FileSelection::Collection(collection.clone()))
        } else if let Some(subset) = &self.subset {
            Ok(FileSelection::Subset(subset.clone()))
        } else if let Some(manifest) = &self.file_list {
            FileSelection::from_manifest(manifest).with_context(|| format!("reading file list {manifest:?}"))
        } else if !self.paths.is_empty() {
            Ok(FileSelection::Paths(self.paths.clone()))
        } else {
            Err(anyhow!("one of --collection, --subset, --path or --file-list is required"))
        }
    }

    fn apply(&self, mut config: TransferConfig) -> TransferConfig {
        if let Some(filter) = &self.filter {
            config = config.with_name_filter(filter.clone());
        }
        if let Some(n) = self.workers {
            config = config.with_num_workers(n);
        }
        if let Some(n) = self.batch_size {
            config = config.with_batch_size(n);
        }
        if let Some(dir) = &self.ledger_dir {
            config = config.with_ledger_dir(dir.clone());
        }
        config.with_verify_only(self.verify_only)
    }
}

impl Cli {
    async fn run(self) -> Result<TransferSummary> {
        let common = self.common;
        let selection = common.selection()?;
        let retry = RetryConfig::default();
        let api_token = common.api_token.clone().or_else(|| std::env::var("BULK_XFER_API_TOKEN").ok());
        let metadata = HttpMetadataService::new(&common.metadata_endpoint, api_token, retry.clone())?;
        let store = HttpObjectStore::new(&common.store_endpoint, retry.clone())?;

        let (config, destination_store): (TransferConfig, Option<Arc<dyn ObjectStore>>) = match self.command {
            Command::Download { destination } => {
                (TransferConfig::new(TransferDirection::Download, destination, selection), None)
            },
            Command::Upload { source } => (TransferConfig::new(TransferDirection::Upload, source, selection), None),
            Command::Copy(args) => {
                let prefix: ObjectLocator = args.destination.parse()?;
                let mut creds = Credentials::new(
                    args.destination_access_key_id,
                    args.destination_secret_access_key,
                    args.destination_session_token.unwrap_or_default(),
                );
                creds.destination = Some(prefix.clone());
                let dest_store: Option<Arc<dyn ObjectStore>> = match args.destination_endpoint {
                    Some(endpoint) => Some(HttpObjectStore::new(&endpoint, retry)?),
                    None => None,
                };
                let config = TransferConfig::new(TransferDirection::RemoteCopy, std::env::current_dir()?, selection)
                    .with_remote_destination(prefix, creds);
                (config, dest_store)
            },
        };

        let mut engine = TransferEngine::new(common.apply(config), metadata, store);
        if let Some(dest) = destination_store {
            engine = engine.with_destination_store(dest);
        }

        let cancel = engine.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted; stopping after in-flight files.");
                cancel.cancel();
            }
        });

        Ok(engine.run().await?)
    }
}

fn print_summary(summary: &TransferSummary) {
    eprintln!("Job {}", summary.job_id);
    eprintln!(
        "  requested: {}  succeeded: {}  skipped: {}  failed: {}  (previously completed: {})",
        summary.requested, summary.succeeded, summary.skipped, summary.failed, summary.previously_completed
    );
    eprintln!(
        "  {} bytes in {:.1}s",
        summary.bytes_transferred,
        summary.elapsed.as_secs_f64()
    );
    if let Some(hint) = &summary.retry_hint {
        eprintln!("  {hint}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let version = env!("CARGO_PKG_VERSION");
    if cli.common.verbose {
        init_logging(LoggingConfig::console(version));
    } else {
        init_logging(LoggingConfig::new(version));
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: could not start the runtime: {e}");
            return ExitCode::FAILURE;
        },
    };

    match runtime.block_on(cli.run()) {
        Ok(summary) => {
            print_summary(&summary);
            if summary.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("error: {e:#}");
            let fatal = e.downcast_ref::<BulkTransferError>().is_some_and(|e| e.is_fatal_for_run());
            if fatal {
                ExitCode::from(EXIT_INFRASTRUCTURE_UNRESPONSIVE)
            } else {
                ExitCode::FAILURE
            }
        },
    }
}
