//! Newline-delimited JSON message input.
//!
//! Each line is one already-decoded [`Message`]. Lines that do not parse are
//! logged and skipped; the stream ends at end of input or on cancellation.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::Message;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    pub lines: u64,
    pub delivered: u64,
    pub malformed: u64,
}

/// Open a file, or stdin for `-`
pub async fn open_input(path: &Path) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if path == Path::new("-") {
        info!("Reading messages from stdin");
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open input {:?}", path))?;
    info!("Reading messages from {:?}", path);
    Ok(Box::new(BufReader::new(file)))
}

/// Feed every message in `reader` to `sender`, blocking while all workers are busy
pub async fn pump_messages<R>(
    reader: R,
    sender: flume::Sender<Message>,
    cancel: CancellationToken,
) -> Result<SourceStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = SourceStats::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Input cancelled");
                break;
            }
            line = lines.next_line() => line.context("Failed to read input")?,
        };
        let Some(line) = line else {
            debug!("End of input");
            break;
        };

        stats.lines += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: Message = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(line = stats.lines, "Skipping malformed message: {}", e);
                metrics::counter!("tracker.input.malformed_total").increment(1);
                stats.malformed += 1;
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Input cancelled");
                break;
            }
            sent = sender.send_async(message) => {
                if sent.is_err() {
                    warn!("Tracker stopped accepting messages");
                    break;
                }
            }
        }
        stats.delivered += 1;
    }

    Ok(stats)
}
