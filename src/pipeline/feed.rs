use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::packet::{InterfaceId, PacketRecord};
use crate::pipeline::Shared;

/// What a capture collaborator sends down its channel
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureMessage {
    Frame(PacketRecord),
    /// Capture is suspended; frames may follow later
    Paused,
    /// Capture finished on purpose
    Ended,
}

/// State of one attached capture feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Active,
    Paused,
    /// The collaborator sent an end marker
    Ended,
    /// The channel closed without an end marker
    Lost,
    /// The monitor stopped first
    Stopped,
}

impl FeedStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Lost | Self::Stopped)
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Ended => "ended",
            Self::Lost => "lost",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Pump one capture channel into the monitor until it ends or the monitor stops
pub(crate) async fn run_feed(
    shared: Arc<Shared>,
    interface: InterfaceId,
    mut frames: mpsc::Receiver<CaptureMessage>,
    status: watch::Sender<FeedStatus>,
    cancel: CancellationToken,
) {
    info!(interface = %interface, "capture feed attached");
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                status.send_replace(FeedStatus::Stopped);
                break;
            }
            message = frames.recv() => message,
        };

        match message {
            Some(CaptureMessage::Frame(record)) => {
                if *status.borrow() == FeedStatus::Paused {
                    status.send_replace(FeedStatus::Active);
                    debug!(interface = %interface, "capture resumed");
                }
                // Rejections are counted by the monitor
                if let Err(IngestError::Stopped) = shared.ingest(&interface, record) {
                    status.send_replace(FeedStatus::Stopped);
                    break;
                }
            }
            Some(CaptureMessage::Paused) => {
                status.send_replace(FeedStatus::Paused);
                info!(interface = %interface, "capture paused");
            }
            Some(CaptureMessage::Ended) => {
                status.send_replace(FeedStatus::Ended);
                info!(interface = %interface, "capture ended");
                break;
            }
            None => {
                status.send_replace(FeedStatus::Lost);
                warn!(interface = %interface, "capture feed closed without an end marker");
                break;
            }
        }
    }
}
