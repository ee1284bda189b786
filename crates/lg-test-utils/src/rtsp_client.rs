//! RTSP test client: publisher and reader flows over the server's dialect.

use bytes::Bytes;
use lg_media::{Description, sdp};
use server::servers::rtsp::message::{
    Request, Response, RtspMessage, read_message, serialize_frame, serialize_request,
};
use std::io;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub struct RtspTestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    host: String,
    cseq: u32,
}

impl RtspTestClient {
    pub async fn connect(addr: &str) -> io::Result<RtspTestClient> {
        let stream = TcpStream::connect(addr).await?;
        let (rd, wr) = stream.into_split();
        Ok(RtspTestClient {
            reader: BufReader::new(rd),
            writer: wr,
            host: addr.to_owned(),
            cseq: 0,
        })
    }

    pub fn uri(&self, path: &str) -> String {
        format!("rtsp://{}/{path}", self.host)
    }

    /// Send one request and wait for its response.
    pub async fn request(
        &mut self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> io::Result<Response> {
        self.cseq += 1;
        let mut req = Request::new(method, uri);
        req.headers.insert("cseq".to_owned(), self.cseq.to_string());
        for (name, value) in headers {
            req.headers
                .insert(name.to_ascii_lowercase(), (*value).to_owned());
        }
        req.body = Bytes::copy_from_slice(body);
        self.writer.write_all(&serialize_request(&req)).await?;

        loop {
            match read_message(&mut self.reader).await {
                Ok((RtspMessage::Response(res), _)) => return Ok(res),
                Ok(_) => continue,
                Err(e) => return Err(io::Error::other(e.to_string())),
            }
        }
    }

    /// Full publisher handshake: ANNOUNCE, SETUP each track, RECORD.
    pub async fn publish(&mut self, path: &str, desc: &Description) -> io::Result<Response> {
        let uri = self.uri(path);
        let body = sdp::marshal(desc);
        let res = self
            .request(
                "ANNOUNCE",
                &uri,
                &[("content-type", "application/sdp")],
                body.as_bytes(),
            )
            .await?;
        if res.status != 200 {
            return Ok(res);
        }
        for track in 0..desc.medias.len() {
            let track_uri = format!("{uri}/trackID={track}");
            let res = self.request("SETUP", &track_uri, &[], &[]).await?;
            if res.status != 200 {
                return Ok(res);
            }
        }
        self.request("RECORD", &uri, &[], &[]).await
    }

    /// Reader handshake: DESCRIBE, SETUP each announced track, PLAY.
    pub async fn play(&mut self, path: &str) -> io::Result<Response> {
        let uri = self.uri(path);
        let res = self.request("DESCRIBE", &uri, &[], &[]).await?;
        if res.status != 200 {
            return Ok(res);
        }
        let desc = sdp::unmarshal(&String::from_utf8_lossy(&res.body))
            .map_err(|e| io::Error::other(e.to_string()))?;
        for track in 0..desc.medias.len() {
            let track_uri = format!("{uri}/trackID={track}");
            let res = self.request("SETUP", &track_uri, &[], &[]).await?;
            if res.status != 200 {
                return Ok(res);
            }
        }
        self.request("PLAY", &uri, &[], &[]).await
    }

    /// Push one interleaved media frame (publisher side).
    pub async fn send_frame(&mut self, track: usize, payload: &[u8]) -> io::Result<()> {
        let buf = serialize_frame((track * 2) as u8, payload);
        self.writer.write_all(&buf).await
    }

    /// Await the next interleaved media frame (reader side).
    pub async fn recv_frame(&mut self) -> io::Result<(usize, Bytes)> {
        loop {
            match read_message(&mut self.reader).await {
                Ok((RtspMessage::Frame { channel, payload }, _)) => {
                    return Ok((usize::from(channel / 2), payload));
                }
                Ok(_) => continue,
                Err(e) => return Err(io::Error::other(e.to_string())),
            }
        }
    }

    pub async fn teardown(&mut self, path: &str) -> io::Result<Response> {
        let uri = self.uri(path);
        self.request("TEARDOWN", &uri, &[], &[]).await
    }
}
