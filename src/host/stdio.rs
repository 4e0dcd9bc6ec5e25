//! Newline-delimited JSON transport for the host bridge.
//!
//! Reads `CommandEnvelope` lines, routes each through the
//! [`HostCommandServer`] on its own task, and writes `ResponseEnvelope` and
//! outgoing `EventEnvelope` lines. Responses may therefore arrive out of
//! order; hosts match them by `request_id`.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use crate::error::{Result, UpdateError};
use crate::host::channel::HostCommandServer;
use crate::host::contract::{CommandEnvelope, CommandName, ResponseEnvelope};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

/// Run the bridge over stdin/stdout until stdin closes or `runtime.stop`.
pub async fn run_stdio_bridge(server: HostCommandServer) -> Result<()> {
    run_bridge(server, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the bridge over any byte stream pair.
pub async fn run_bridge<R, W>(server: HostCommandServer, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(BufWriter::new(writer)));

    let event_writer = Arc::clone(&writer);
    let mut outgoing = server.bridge().subscribe_outgoing();
    let forwarder = tokio::spawn(async move {
        loop {
            match outgoing.recv().await {
                Ok(event) => {
                    if let Err(e) = write_json(&event_writer, &event).await {
                        warn!(error = %e, "cannot write event envelope; stopping event forwarder");
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = run_reader(server, reader, Arc::clone(&writer)).await;

    forwarder.abort();
    let _ = forwarder.await;
    result
}

async fn run_reader<R, W>(server: HostCommandServer, reader: R, writer: SharedWriter<W>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let stop = server.stop_token();

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            () = stop.cancelled() => break,
            read = reader.read_line(&mut line) => read.map_err(|e| {
                UpdateError::Channel(format!("failed to read from host: {e}"))
            })?,
        };
        if bytes_read == 0 {
            info!("host input closed (EOF); shutting down bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                let response = ResponseEnvelope::error(
                    "parse-error",
                    format!("failed to parse command envelope: {e}"),
                );
                write_json(&writer, &response).await?;
                continue;
            }
        };

        if envelope.command == CommandName::RuntimeStop {
            let response = server.handle(&envelope).await;
            write_json(&writer, &response).await?;
            break;
        }

        let server = server.clone();
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let response = server.handle(&envelope).await;
            if let Err(e) = write_json(&writer, &response).await {
                error!(request_id = %envelope.request_id, error = %e, "cannot write response");
            }
        });
    }

    Ok(())
}

/// Write one JSON line and flush.
async fn write_json<W, T>(writer: &SharedWriter<W>, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)
        .map_err(|e| UpdateError::Channel(format!("failed to serialize envelope: {e}")))?;
    let mut w = writer.lock().await;
    w.write_all(json.as_bytes())
        .await
        .map_err(|e| UpdateError::Channel(format!("failed to write to host: {e}")))?;
    w.write_all(b"\n")
        .await
        .map_err(|e| UpdateError::Channel(format!("failed to write newline to host: {e}")))?;
    w.flush()
        .await
        .map_err(|e| UpdateError::Channel(format!("failed to flush host output: {e}")))?;
    Ok(())
}
