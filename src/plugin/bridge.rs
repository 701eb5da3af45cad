//! JSON-lines transport between the host and the coordinator.
//!
//! The host writes one [`HostEvent`] per line to the plugin's stdin and reads
//! one [`HostOutput`] per line from its stdout. Logging goes to stderr, so
//! nothing else may be written to stdout while the bridge runs.

use crate::plugin::coordinator::CoordinatorHandle;
use crate::plugin::events::{HostEvent, HostOutput};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the bridge saw before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeSummary {
    pub lines: u64,
    pub events: u64,
    /// Lines that were not a valid host event
    pub rejected: u64,
    pub outputs: u64,
}

/// Pump events from `reader` into the coordinator and outputs from
/// `outputs` into `writer`.
///
/// Returns once the host closes its end, sends `shutdown`, or `cancel`
/// fires. Every key is destroyed and every queued output written before
/// this returns.
pub async fn run<R, W>(
    reader: R,
    writer: W,
    handle: CoordinatorHandle,
    outputs: mpsc::Receiver<HostOutput>,
    cancel: CancellationToken,
) -> io::Result<BridgeSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let stop_writer = CancellationToken::new();
    let writer_task = tokio::spawn(write_outputs(outputs, writer, stop_writer.clone()));

    let mut summary = BridgeSummary::default();
    let mut lines = BufReader::new(reader).lines();
    let read_result = loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("host closed the event stream");
                break Ok(());
            }
            Err(e) => break Err(e),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        summary.lines += 1;

        let event: HostEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed host message");
                summary.rejected += 1;
                continue;
            }
        };
        summary.events += 1;
        let last = matches!(event, HostEvent::Shutdown);
        if handle.send(event).await.is_err() {
            tracing::warn!("coordinator stopped accepting events");
            break Ok(());
        }
        if last {
            break Ok(());
        }
    };

    handle.shutdown().await;
    stop_writer.cancel();
    match writer_task.await {
        Ok(Ok(written)) => summary.outputs = written,
        Ok(Err(e)) => tracing::error!(error = %e, "failed writing to host"),
        Err(e) => tracing::error!(error = %e, "output writer task failed"),
    }

    read_result.map(|()| summary)
}

async fn write_outputs<W>(
    mut outputs: mpsc::Receiver<HostOutput>,
    mut writer: W,
    stop: CancellationToken,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    loop {
        let output = tokio::select! {
            output = outputs.recv() => output,
            _ = stop.cancelled() => break,
        };
        let Some(output) = output else {
            return finish(writer, written).await;
        };
        write_line(&mut writer, &output).await?;
        written += 1;
    }
    // Drain whatever the coordinator queued before it shut down.
    while let Ok(output) = outputs.try_recv() {
        write_line(&mut writer, &output).await?;
        written += 1;
    }
    finish(writer, written).await
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, output: &HostOutput) -> io::Result<()> {
    let mut line = match serde_json::to_vec(output) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode host output");
            return Ok(());
        }
    };
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

async fn finish<W: AsyncWrite + Unpin>(mut writer: W, written: u64) -> io::Result<u64> {
    writer.shutdown().await?;
    Ok(written)
}
