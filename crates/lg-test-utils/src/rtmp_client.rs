//! RTMP test publisher speaking the server's compact dialect.

use bytes::Bytes;
use server::servers::rtmp::wire::{
    Amf0, MessageReader, RtmpMessage, MSG_AUDIO, MSG_COMMAND_AMF0, MSG_VIDEO, amf0_read_all,
    amf0_write, handshake_client, serialize_message,
};
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub struct RtmpTestPublisher {
    stream: TcpStream,
    messages: MessageReader,
    tid: f64,
}

impl RtmpTestPublisher {
    /// Connect, handshake, and run connect/createStream/publish for
    /// `app`/`key`. Returns an error when the server refuses the publish.
    pub async fn publish(addr: &str, app: &str, key: &str) -> io::Result<RtmpTestPublisher> {
        let mut stream = TcpStream::connect(addr).await?;
        handshake_client(&mut stream)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        let mut publisher = RtmpTestPublisher {
            stream,
            messages: MessageReader::default(),
            tid: 0.0,
        };
        let tid = publisher.next_tid();
        publisher
            .command(vec![
                Amf0::String("connect".to_owned()),
                Amf0::Number(tid),
                Amf0::Object(vec![("app".to_owned(), Amf0::String(app.to_owned()))]),
            ])
            .await?;
        publisher.expect_command("_result").await?;

        let tid = publisher.next_tid();
        publisher
            .command(vec![
                Amf0::String("createStream".to_owned()),
                Amf0::Number(tid),
                Amf0::Null,
            ])
            .await?;
        publisher.expect_command("_result").await?;

        let tid = publisher.next_tid();
        publisher
            .command(vec![
                Amf0::String("publish".to_owned()),
                Amf0::Number(tid),
                Amf0::Null,
                Amf0::String(key.to_owned()),
            ])
            .await?;
        let status = publisher.expect_command("onStatus").await?;
        if !format!("{status:?}").contains("NetStream.Publish.Start") {
            return Err(io::Error::other(format!("publish refused: {status:?}")));
        }
        Ok(publisher)
    }

    fn next_tid(&mut self) -> f64 {
        self.tid += 1.0;
        self.tid
    }

    async fn command(&mut self, values: Vec<Amf0>) -> io::Result<()> {
        let msg = RtmpMessage {
            type_id: MSG_COMMAND_AMF0,
            stream_id: 0,
            payload: Bytes::from(amf0_write(&values)),
        };
        self.stream.write_all(&serialize_message(3, &msg)).await
    }

    async fn expect_command(&mut self, name: &str) -> io::Result<Vec<Amf0>> {
        loop {
            let (msg, _) = self
                .messages
                .read_message(&mut self.stream)
                .await
                .map_err(|e| io::Error::other(e.to_string()))?;
            if msg.type_id != MSG_COMMAND_AMF0 {
                continue;
            }
            let values =
                amf0_read_all(&msg.payload).map_err(|e| io::Error::other(e.to_string()))?;
            if matches!(values.first(), Some(Amf0::String(n)) if n == name) {
                return Ok(values);
            }
        }
    }

    /// Send one opaque video (media 0) or audio (media 1) payload.
    pub async fn send_media(&mut self, media: usize, payload: &[u8]) -> io::Result<()> {
        let msg = RtmpMessage {
            type_id: if media == 1 { MSG_AUDIO } else { MSG_VIDEO },
            stream_id: 1,
            payload: Bytes::copy_from_slice(payload),
        };
        self.stream.write_all(&serialize_message(4, &msg)).await
    }

    /// True once the server has torn the connection down.
    pub async fn is_closed(&mut self) -> bool {
        self.messages.read_message(&mut self.stream).await.is_err()
    }
}
