//! TCP transport: length-prefixed bincode frames and the per-connection
//! task pair.
//!
//! Each accepted socket gets a reader loop (this function) and a spawned
//! writer task. The writer drains the outbound queue; on a close signal it
//! flushes whatever is already queued before dropping the socket, so
//! terminal notices (eviction, logout response) still reach the client.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;

use palaver_shared::{Envelope, ProtocolError, RequestBody, UserProfile};

use crate::connection::{ConnectionBackend, ConnectionHandle};
use crate::dispatcher::Dispatcher;

/// Frame cap. Large enough for a message with an attachment, small enough
/// that a bogus length prefix cannot balloon allocation.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Read one `u32`-big-endian-length-prefixed frame. `Ok(None)` means the
/// peer closed the stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME,
        }
        .into());
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(Envelope::from_bytes(&buf)?))
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = envelope.to_bytes()?;
    if bytes.len() > MAX_FRAME {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME,
        }
        .into());
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve one client socket until it disconnects, logs out, or is evicted.
pub async fn handle_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    queue_capacity: usize,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut read_half, write_half) = stream.into_split();

    let (handle, backend) = ConnectionHandle::new(queue_capacity);
    let mut close_rx = backend.close_rx.clone();
    tracing::info!(peer = %peer, conn = %handle.id, "connection accepted");

    let writer = tokio::spawn(write_loop(write_half, backend));

    let mut profile: Option<UserProfile> = None;
    loop {
        let envelope = tokio::select! {
            _ = close_rx.changed() => break,
            result = read_frame(&mut read_half) => match result {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(conn = %handle.id, error = %e, "read failed");
                    break;
                }
            },
        };

        match envelope {
            Envelope::Request(request) => {
                let is_logout = matches!(request.body, RequestBody::Logout);
                let response = dispatcher.handle(&handle, &mut profile, request).await;
                handle.enqueue(Envelope::Response(response));
                if is_logout {
                    handle.close();
                    break;
                }
            }
            other => {
                // Clients speak in requests; pushes flow the other way.
                tracing::warn!(conn = %handle.id, envelope = ?other, "unexpected envelope, ignoring");
            }
        }
    }

    dispatcher.disconnect(&handle, &profile);
    handle.close();
    if let Err(e) = writer.await {
        tracing::warn!(conn = %handle.id, error = %e, "writer task panicked");
    }
    tracing::info!(peer = %peer, conn = %handle.id, "connection closed");
}

/// Pump the outbound queue onto the socket. After the close signal fires,
/// already-queued envelopes are flushed before the socket drops.
async fn write_loop<W>(mut writer: W, mut backend: ConnectionBackend)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = backend.close_rx.changed() => {
                loop {
                    match backend.outbound_rx.try_recv() {
                        Ok(envelope) => {
                            if let Err(e) = write_frame(&mut writer, &envelope).await {
                                tracing::debug!(error = %e, "flush on close failed");
                                return;
                            }
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
                    }
                }
            }
            envelope = backend.outbound_rx.recv() => {
                let Some(envelope) = envelope else { return };
                if let Err(e) = write_frame(&mut writer, &envelope).await {
                    tracing::debug!(error = %e, "write failed");
                    return;
                }
            }
        }
    }
}
