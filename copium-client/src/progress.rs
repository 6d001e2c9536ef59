//! Download progress reporting
//!
//! Weight downloads publish [`DownloadProgress`] events on a channel; the
//! caller consumes them as a [`ProgressStream`] and may stop the download
//! through its [`DownloadHandle`].

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// A single download progress event
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadProgress {
    /// Bytes received so far for one file
    Progress {
        file: String,
        loaded: u64,
        total: Option<u64>,
    },
    /// File fully available
    Done {
        file: String,
        bytes: u64,
        from_cache: bool,
    },
    /// File could not be downloaded
    Failed { file: String, reason: String },
}

impl DownloadProgress {
    /// Completion percentage, when the total size is known
    pub fn percent(&self) -> Option<u8> {
        match self {
            Self::Progress {
                loaded,
                total: Some(total),
                ..
            } if *total > 0 => Some(((*loaded as f64 / *total as f64) * 100.0).round().min(100.0) as u8),
            Self::Done { .. } => Some(100),
            _ => None,
        }
    }

    pub fn file(&self) -> &str {
        match self {
            Self::Progress { file, .. } | Self::Done { file, .. } | Self::Failed { file, .. } => {
                file
            }
        }
    }
}

/// Producer side of a progress channel
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<DownloadProgress>,
    cancelled: watch::Receiver<bool>,
}

impl ProgressSender {
    /// Publish an event; a dropped stream is not an error
    pub fn send(&self, event: DownloadProgress) {
        let _ = self.tx.send(event);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

/// Consumer side of a progress channel
pub struct ProgressStream {
    receiver: mpsc::UnboundedReceiver<DownloadProgress>,
}

impl Stream for ProgressStream {
    type Item = DownloadProgress;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Handle for cancelling a download
///
/// Dropping the handle does not cancel; call [`DownloadHandle::cancel`].
pub struct DownloadHandle {
    cancel_tx: watch::Sender<bool>,
}

impl DownloadHandle {
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

/// Create a connected progress sender, stream and cancel handle
pub fn channel() -> (ProgressSender, ProgressStream, DownloadHandle) {
    let (tx, receiver) = mpsc::unbounded_channel();
    let (cancel_tx, cancelled) = watch::channel(false);
    (
        ProgressSender { tx, cancelled },
        ProgressStream { receiver },
        DownloadHandle { cancel_tx },
    )
}
