//! Streaming COPY from the source into the destination.

use crate::data_source::DataSource;
use crate::error::{Result, SyncError};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio_postgres::CopyInSink;
use tracing::debug;

const THROTTLE_PAUSE: Duration = Duration::from_millis(10);

/// Pipe `COPY ... TO STDOUT` on the source into `COPY ... FROM STDIN` on the
/// destination, one chunk at a time. Returns the rows written.
///
/// The destination's write side applies backpressure to the source read.
pub async fn copy(
    source: &mut DataSource,
    destination: &mut DataSource,
    copy_out: &str,
    copy_in: &str,
    throttle_bytes_per_second: Option<u64>,
    table: &str,
) -> Result<u64> {
    debug!("{}: {}", source.label(), copy_out);
    debug!("{}: {}", destination.label(), copy_in);

    let destination_client = destination.client().await?;
    let sink: CopyInSink<Bytes> = destination_client.copy_in(copy_in).await?;
    futures::pin_mut!(sink);

    let source_client = source.client().await?;
    let stream = source_client.copy_out(copy_out).await?;
    futures::pin_mut!(stream);

    let started = Instant::now();
    let mut bytes_count: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;

        if let Some(limit) = throttle_bytes_per_second {
            while over_limit(bytes_count, started.elapsed(), limit) {
                tokio::time::sleep(THROTTLE_PAUSE).await;
            }
        }

        bytes_count += chunk.len() as u64;
        sink.send(chunk).await.map_err(|e| {
            SyncError::transfer(table, format!("COPY send failed: {}", e))
        })?;
    }

    let rows = sink.finish().await?;
    debug!("{}: copied {} rows ({} bytes)", table, rows, bytes_count);
    Ok(rows)
}

/// Whether the running average of `bytes` over `elapsed` is above `limit` per second.
pub fn over_limit(bytes: u64, elapsed: Duration, limit: u64) -> bool {
    limit > 0 && bytes as f64 > limit as f64 * elapsed.as_secs_f64()
}
