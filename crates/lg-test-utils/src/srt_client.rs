//! SRT test client for the server's datagram session layer.

use std::io;
use tokio::net::UdpSocket;

pub struct SrtTestClient {
    socket: UdpSocket,
}

impl SrtTestClient {
    /// Handshake with the given stream id (e.g. `#!::r=cam,m=publish`).
    /// Returns an error with the server's reason when refused.
    pub async fn connect(addr: &str, streamid: &str) -> io::Result<SrtTestClient> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(addr).await?;
        socket.send(format!("SRT1 {streamid}").as_bytes()).await?;

        let mut buf = vec![0u8; 1500];
        let n = tokio::time::timeout(std::time::Duration::from_secs(5), socket.recv(&mut buf))
            .await
            .map_err(|_| io::Error::other("handshake timeout"))??;
        let reply = String::from_utf8_lossy(&buf[..n]).to_string();
        if reply != "OK" {
            return Err(io::Error::other(reply));
        }
        Ok(SrtTestClient { socket })
    }

    pub async fn send_media(&self, media: u8, payload: &[u8]) -> io::Result<()> {
        let mut datagram = Vec::with_capacity(payload.len() + 1);
        datagram.push(media);
        datagram.extend_from_slice(payload);
        self.socket.send(&datagram).await.map(|_| ())
    }

    pub async fn recv_media(&self) -> io::Result<(u8, Vec<u8>)> {
        let mut buf = vec![0u8; 1500];
        let n = self.socket.recv(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::other("empty datagram"));
        }
        Ok((buf[0], buf[1..n].to_vec()))
    }
}
