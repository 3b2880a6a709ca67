//! Error collector draining worker failure envelopes
//!
//! Workers push [`JobError`] envelopes through an [`ErrorSender`]; a single
//! draining task owns all user-visible error output. The dispatcher closes
//! the collector after the pool has drained and reads back the error count.

use crate::error::JobError;
use crate::logging::Logger;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cloneable handle workers use to report failure envelopes.
#[derive(Debug, Clone)]
pub struct ErrorSender {
    tx: mpsc::UnboundedSender<JobError>,
}

impl ErrorSender {
    /// Push an envelope. A send after the collector closed is silently
    /// dropped; the job is already recorded in the failure ledger.
    pub fn report(&self, err: JobError) {
        let _ = self.tx.send(err);
    }
}

/// Collector task logging every reported envelope.
#[derive(Debug)]
pub struct ErrorCollector {
    tx: ErrorSender,
    task: JoinHandle<usize>,
}

impl ErrorCollector {
    pub fn start(logger: Logger) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobError>();
        let task = tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(err) = rx.recv().await {
                logger.error(&err.to_string());
                count += 1;
            }
            count
        });
        Self {
            tx: ErrorSender { tx },
            task,
        }
    }

    pub fn sender(&self) -> ErrorSender {
        self.tx.clone()
    }

    /// Close the channel and wait for the drain task; returns the number of
    /// envelopes that were reported.
    pub async fn close(self) -> usize {
        drop(self.tx);
        self.task.await.unwrap_or(0)
    }
}
