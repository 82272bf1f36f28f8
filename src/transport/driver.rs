//! Per-connection driver task.
//!
//! The driver owns the stream for the lifetime of one [`DebugConnection`]:
//!
//! ```text
//! DebugConnection ─► outbound queue ─► driver ─► PacketChannel ─► socket
//!        ▲                                │
//!        └──────────── receive_frame ◄────┘
//! ```
//!
//! It flushes queued packets, reads and reassembles incoming ones, and hands
//! each complete packet to the connection. When the stream ends, errors, or
//! the connection is closed, it reports the disconnect and drops the stream.

use tokio::io::{AsyncRead, AsyncWrite};

use super::PacketChannel;
use crate::connection::DebugConnection;
use crate::error::DebugWireError;

/// Run `connection` over `stream` until either side ends it.
pub(crate) async fn drive<S>(connection: DebugConnection, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut channel = PacketChannel::with_max_packet_size(stream, connection.max_packet_size());
    connection.transport_connected();

    let error = run(&connection, &mut channel).await;
    connection.transport_disconnected(error);
}

/// Returns the error that ended the connection, if any.
async fn run<S>(connection: &DebugConnection, channel: &mut PacketChannel<S>) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        while let Some(packet) = connection.next_outbound() {
            if let Err(err) = channel.send(&packet).await {
                tracing::error!("Write failed: {}", err);
                return Some(err.to_string());
            }
        }

        if connection.is_closed() {
            return None;
        }

        tokio::select! {
            read = channel.pump() => match read {
                Ok(0) => {
                    tracing::debug!("Peer closed the stream");
                    return None;
                }
                Ok(_) => {
                    if !deliver(connection, channel) {
                        return None;
                    }
                }
                Err(err @ DebugWireError::Protocol(_)) => {
                    // Packets completed ahead of the bad prefix still count.
                    deliver(connection, channel);
                    tracing::warn!("Framing violation, dropping connection: {}", err);
                    return Some(err.to_string());
                }
                Err(err) => {
                    tracing::error!("Read failed: {}", err);
                    return Some(err.to_string());
                }
            },
            _ = connection.woken() => {}
        }
    }
}

/// Hand every complete packet to the connection. Returns `false` once the
/// connection has been closed by one of them.
fn deliver<S>(connection: &DebugConnection, channel: &mut PacketChannel<S>) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(packet) = channel.read() {
        connection.receive_frame(packet);
        if connection.is_closed() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{data_frame, peer_hello, Recorder};
    use crate::connection::{ConnectionConfig, ConnectionEvent};
    use crate::protocol::{encode_packet, Hello};
    use std::rc::Rc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_driver_handshake_and_delivery() {
        LocalSet::new()
            .run_until(async {
                let (local, remote) = duplex(4096);
                let (connection, mut events) = DebugConnection::new(ConnectionConfig::default());
                let recorder = Rc::new(Recorder::default());
                connection.register_service("X", recorder.clone()).unwrap();
                connection.attach(local);

                let mut peer = PacketChannel::new(remote);
                assert!(peer.wait_for_ready(Duration::from_secs(1)).await.unwrap());
                let hello = Hello::decode(peer.read().unwrap()).unwrap();
                assert_eq!(hello.services, vec!["X"]);

                peer.send(&peer_hello(&["X"])).await.unwrap();
                assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

                peer.send(&data_frame("X", &[b"ping"])).await.unwrap();
                while recorder.messages.borrow().is_empty() {
                    tokio::task::yield_now().await;
                }
                assert_eq!(*recorder.messages.borrow(), vec![&b"ping"[..]]);

                assert!(connection.send_message("X", b"pong"));
                assert!(peer.wait_for_ready(Duration::from_secs(1)).await.unwrap());
                assert_eq!(peer.read().unwrap(), data_frame("X", &[b"pong"]));

                drop(peer);
                assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
            })
            .await;
    }

    #[tokio::test]
    async fn test_driver_drops_connection_on_framing_violation() {
        LocalSet::new()
            .run_until(async {
                let (local, mut remote) = duplex(4096);
                let (connection, mut events) = DebugConnection::new(ConnectionConfig::default());
                connection.attach(local);

                // Length prefix smaller than the prefix itself.
                remote.write_all(&3u32.to_le_bytes()).await.unwrap();

                assert_eq!(events.recv().await, Some(ConnectionEvent::ConnectionFailed));
                assert!(connection.is_closed());
                assert!(connection.error_string().is_some());
            })
            .await;
    }

    #[tokio::test]
    async fn test_packets_before_violation_are_delivered() {
        LocalSet::new()
            .run_until(async {
                let (local, mut remote) = duplex(4096);
                let (connection, mut events) = DebugConnection::new(ConnectionConfig::default());
                let recorder = Rc::new(Recorder::default());
                connection.register_service("X", recorder.clone()).unwrap();
                connection.attach(local);

                let mut stream = Vec::new();
                for body in [peer_hello(&["X"]), data_frame("X", &[b"last words"])] {
                    stream.extend_from_slice(&encode_packet(&body).unwrap().unwrap());
                }
                stream.extend_from_slice(&3u32.to_le_bytes());
                remote.write_all(&stream).await.unwrap();

                assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));
                assert_eq!(events.recv().await, Some(ConnectionEvent::ConnectionFailed));
                assert_eq!(*recorder.messages.borrow(), vec![&b"last words"[..]]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_close_releases_stream() {
        LocalSet::new()
            .run_until(async {
                let (local, remote) = duplex(4096);
                let (connection, mut events) = DebugConnection::new(ConnectionConfig::default());
                connection.attach(local);

                let mut peer = PacketChannel::new(remote);
                assert!(peer.wait_for_ready(Duration::from_secs(1)).await.unwrap());
                peer.read();

                connection.close();
                assert_eq!(events.recv().await, Some(ConnectionEvent::ConnectionFailed));

                // Driver observes the close and drops its end.
                assert!(!peer.wait_for_ready(Duration::from_secs(1)).await.unwrap());
            })
            .await;
    }
}
