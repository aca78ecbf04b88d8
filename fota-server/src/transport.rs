//! UDP transport: one datagram in, handled to completion, replies out, next datagram.

use std::io;

use fota_core::{ChunkServer, OutboundAction, ServerError};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Larger than any packet; longer datagrams are cut and their tail ignored.
const RECV_BUFFER_SIZE: usize = 1536;

/// Serve until the socket fails. Protocol errors are logged and the datagram dropped.
pub async fn run(socket: &UdpSocket, server: &mut ChunkServer) -> io::Result<()> {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        match server.on_datagram(from, &buf[..n]) {
            Ok(actions) => {
                for OutboundAction::Send(to, bytes) in actions {
                    if let Err(e) = socket.send_to(&bytes, to).await {
                        warn!(%to, error = %e, "send failed");
                    }
                }
            }
            Err(ServerError::Decode(e)) => debug!(%from, error = %e, "datagram dropped"),
            Err(e) => warn!(%from, error = %e, "request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use fota_core::{wire, ArtifactDirectory, Message, ServerOptions, REQUEST_PACKET_SIZE};

    async fn request(client: &UdpSocket, server: SocketAddr, msg: &Message) -> Message {
        client
            .send_to(&wire::encode(msg).unwrap(), server)
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("no reply")
            .unwrap();
        assert_eq!(from, server);
        wire::decode(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn serves_summary_and_chunks_over_udp() {
        let root = std::env::temp_dir().join(format!("fota-udp-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let alpha: Vec<u8> = (0..200u32).map(|i| (i * 5) as u8).collect();
        std::fs::write(root.join("a.bin"), &alpha).unwrap();
        std::fs::write(root.join("b.bin"), b"beta").unwrap();
        std::fs::write(root.join("repository.repo"), "alpha a.bin\nbeta b.bin\n").unwrap();

        let mut server = ChunkServer::new(
            ArtifactDirectory::load(&root).unwrap(),
            ServerOptions::default(),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        tokio::spawn(async move { run(&socket, &mut server).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let summary = request(
            &client,
            server_addr,
            &Message::GetArtifact {
                artifact: "alpha".into(),
            },
        )
        .await;
        let expected_chunks = alpha.len().div_ceil(REQUEST_PACKET_SIZE) as u16;
        assert_eq!(
            summary,
            Message::Summary {
                session_id: 1,
                nr_chunks: expected_chunks
            }
        );

        // garbage is dropped without a reply and the server keeps going
        client.send_to(&[0xFF; 7], server_addr).await.unwrap();

        let chunk = request(
            &client,
            server_addr,
            &Message::GetChunk {
                session_id: 1,
                chunk_id: 0,
            },
        )
        .await;
        assert_eq!(
            chunk,
            Message::Chunk {
                chunk_id: 0,
                data: alpha[..REQUEST_PACKET_SIZE].to_vec()
            }
        );
        let _ = std::fs::remove_dir_all(&root);
    }
}
