use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use transfer_client::FileDescriptor;

use crate::errors::{BulkTransferError, Result};
use crate::transfer_task::TaskContext;

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<FileDescriptor>>>;

/// A fixed set of workers pulling files from a bounded queue.
///
/// Per-file failures are reported through the task context and never stop the pool.
/// Cancelling `cancel` stops workers from taking new files; files already started run to
/// completion. The first run-fatal error aborts every worker, in-flight files included,
/// and [`TransferWorkerPool::finish`] returns it.
pub struct TransferWorkerPool {
    sender: Option<mpsc::Sender<FileDescriptor>>,
    workers: JoinSet<()>,
    cancel: CancellationToken,
    abort: CancellationToken,
    fatal: Arc<Mutex<Option<BulkTransferError>>>,
}

impl TransferWorkerPool {
    pub fn start(
        context: Arc<TaskContext>,
        num_workers: usize,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let fatal = Arc::new(Mutex::new(None));
        let abort = CancellationToken::new();

        let mut workers = JoinSet::new();
        for worker_id in 0..num_workers.max(1) {
            workers.spawn(worker_loop(
                worker_id,
                context.clone(),
                receiver.clone(),
                cancel.clone(),
                abort.clone(),
                fatal.clone(),
            ));
        }
        info!(num_workers, queue_capacity, "worker pool started");

        Self {
            sender: Some(sender),
            workers,
            cancel,
            abort,
            fatal,
        }
    }

    /// Queues a file, waiting while the queue is full. Fails once the run is cancelled.
    pub async fn submit(&self, file: FileDescriptor) -> Result<()> {
        let Some(sender) = &self.sender else {
            return Err(BulkTransferError::InternalError("submit on a closed pool".to_owned()));
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BulkTransferError::Cancelled),
            sent = sender.send(file) => sent.map_err(|_| BulkTransferError::Cancelled),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops the run from outside the pool, recording `err` as the reason. In-flight files
    /// are abandoned.
    pub fn abort_with(&self, err: BulkTransferError) {
        store_fatal(&self.fatal, err);
        self.abort.cancel();
        self.cancel.cancel();
    }

    /// Closes the queue, waits for the workers to drain it and returns the fatal error, if
    /// one ended the run. After a plain cancellation this waits for in-flight files.
    pub async fn finish(mut self) -> Result<()> {
        drop(self.sender.take());
        if self.abort.is_cancelled() {
            self.workers.abort_all();
        }

        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                error!("transfer worker panicked: {e}");
                store_fatal(&self.fatal, BulkTransferError::InternalError(format!("worker panicked: {e}")));
            }
        }

        match self.fatal.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(err) => Err(err),
            None if self.cancel.is_cancelled() => Err(BulkTransferError::Cancelled),
            None => Ok(()),
        }
    }
}

/// Keeps the first fatal error; later ones are consequences of the cancellation.
fn store_fatal(slot: &Mutex<Option<BulkTransferError>>, err: BulkTransferError) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(err);
    }
}

async fn worker_loop(
    worker_id: usize,
    context: Arc<TaskContext>,
    receiver: SharedReceiver,
    cancel: CancellationToken,
    abort: CancellationToken,
    fatal: Arc<Mutex<Option<BulkTransferError>>>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            file = async { receiver.lock().await.recv().await } => file,
        };
        let Some(file) = next else {
            break;
        };

        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            result = context.process(&file) => result,
        };

        if let Some(err) = context.report(&file, result).await {
            error!(worker_id, file_id = file.file_id.as_str(), "unrecoverable error, stopping the run: {err}");
            store_fatal(&fatal, err);
            abort.cancel();
            cancel.cancel();
            break;
        }
    }
    debug!(worker_id, "worker exiting");
}
