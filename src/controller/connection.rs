//! Low-level link to the central controller: connect-with-retry,
//! handshake, and NUL-delimited JSON framing in both directions.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Result, SiphonError};
use crate::forwarding::NodeId;

const CONNECT_RETRIES: u32 = 5;
const OUTBOX_CAPACITY: usize = 256;

async fn connect_with_backoff(host: &str, port: u16) -> Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..CONNECT_RETRIES {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(host, port, attempt, error = %e, "connect to controller failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }
    }
    Err(SiphonError::Io(last_err.unwrap()))
}

/// Performs the handshake (`u32 hostname_len | hostname | <- u32
/// node_id`) and spins up the send/receive tasks. Returns the assigned
/// local node id, a channel to enqueue outbound JSON values on, and a
/// channel the caller reads inbound JSON values from.
pub async fn connect_and_start(
    host: &str,
    port: u16,
    local_hostname: String,
) -> Result<(NodeId, mpsc::Sender<serde_json::Value>, mpsc::Receiver<serde_json::Value>)> {
    let stream = connect_with_backoff(host, port).await?;
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let hostname_bytes = local_hostname.as_bytes();
    write_half.write_all(&(hostname_bytes.len() as u32).to_ne_bytes()).await?;
    write_half.write_all(hostname_bytes).await?;

    let mut id_buf = [0u8; 4];
    read_half.read_exact(&mut id_buf).await?;
    let local_node_id = u32::from_ne_bytes(id_buf);
    info!(local_node_id, "connection to controller established");

    let (out_tx, mut out_rx) = mpsc::channel::<serde_json::Value>(OUTBOX_CAPACITY);
    tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            let mut bytes = match serde_json::to_vec(&value) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "failed to serialize outbound control message");
                    continue;
                }
            };
            bytes.push(0);
            if write_half.write_all(&bytes).await.is_err() {
                warn!("controller link write failed, outbound task stopping");
                return;
            }
        }
    });

    let (in_tx, in_rx) = mpsc::channel::<serde_json::Value>(OUTBOX_CAPACITY);
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) => {
                    info!("controller connection closed");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "controller link read failed, inbound task stopping");
                    return;
                }
            };
            buf.extend_from_slice(&chunk[..n]);
            while let Some(pos) = buf.iter().position(|&b| b == 0) {
                let frame: Vec<u8> = buf.drain(..=pos).collect();
                let frame = &frame[..frame.len() - 1]; // drop the trailing NUL
                match serde_json::from_slice::<serde_json::Value>(frame) {
                    Ok(value) => {
                        if in_tx.send(value).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "malformed control message frame, discarding"),
                }
            }
        }
    });

    Ok((local_node_id, out_tx, in_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_surfaces_assigned_node_id_and_frames_json_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_ne_bytes(len_buf) as usize;
            let mut hostname_buf = vec![0u8; len];
            stream.read_exact(&mut hostname_buf).await.unwrap();
            stream.write_all(&7u32.to_ne_bytes()).await.unwrap();

            let mut frame = serde_json::to_vec(&serde_json::json!({"Type": 3, "Msg": {"SessionID": "X"}})).unwrap();
            frame.push(0);
            stream.write_all(&frame).await.unwrap();
            stream
        });

        let (node_id, _out_tx, mut in_rx) = connect_and_start("127.0.0.1", addr.port(), "test-host".into())
            .await
            .unwrap();
        assert_eq!(node_id, 7);

        let received = in_rx.recv().await.unwrap();
        assert_eq!(received["Type"], 3);
        server.abort();
    }
}
