// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for the Success/Error signalling that rides the migration byte
//! stream. Each frame is a big-endian `u16` length followed by that many
//! payload bytes; a zero length is Success, a non-zero length carries a
//! UTF-8 error message. There is no versioning and no heartbeat.
//!
//! Signalling deliberately bypasses the cluster database and the master so
//! that the two hosts cannot deadlock against the same locks they must
//! hold for the migration.
//!
//! Reads are exact: the raw memory-image bytes that follow a frame on the
//! same stream are never buffered past the frame boundary.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{MigrateError, MigrateRole};

/// The bidirectional cleartext stream a migration runs over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> ByteStream for T {}

/// Most error text one frame can carry.
const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Transport-level failures on the handshake channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error on migration stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("non-UTF8 error payload: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A signalling frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Success,
    Error(String),
}

/// One side's handle on the handshake channel. `peer` names the role at
/// the other end, for error attribution.
pub struct Handshake<T> {
    stream: T,
    peer: MigrateRole,
}

impl<T: ByteStream> Handshake<T> {
    pub fn new(stream: T, peer: MigrateRole) -> Self {
        Self { stream, peer }
    }

    /// The underlying stream, for the bulk memory-image transfer that runs
    /// between barriers.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    pub async fn send(&mut self, m: Message) -> Result<(), ProtocolError> {
        let mut frame = BytesMut::new();
        match m {
            Message::Success => frame.put_u16(0),
            Message::Error(text) => {
                let payload = truncate_payload(&text);
                frame.put_u16(payload.len() as u16);
                frame.put_slice(payload);
            }
        }
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message, ProtocolError> {
        let len = self.stream.read_u16().await? as usize;
        if len == 0 {
            return Ok(Message::Success);
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(Message::Error(String::from_utf8(payload)?))
    }

    /// `recv` that raises when the peer reports an error.
    pub async fn recv_success(&mut self) -> Result<(), MigrateError> {
        match self.recv().await? {
            Message::Success => Ok(()),
            Message::Error(msg) => {
                Err(MigrateError::Remote(self.peer, msg))
            }
        }
    }
}

/// Clips error text to what one frame can carry, on a char boundary.
fn truncate_payload(text: &str) -> &[u8] {
    if text.len() <= MAX_PAYLOAD {
        return text.as_bytes();
    }
    let mut end = MAX_PAYLOAD;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn success_round_trip() {
        let (a, b) = duplex(64);
        let mut tx = Handshake::new(a, MigrateRole::Destination);
        let mut rx = Handshake::new(b, MigrateRole::Source);
        tx.send(Message::Success).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::Success);
    }

    #[tokio::test]
    async fn error_round_trip() {
        let (a, b) = duplex(64);
        let mut tx = Handshake::new(a, MigrateRole::Destination);
        let mut rx = Handshake::new(b, MigrateRole::Source);
        tx.send(Message::Error("disk attach refused".to_string()))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Message::Error("disk attach refused".to_string())
        );
    }

    #[tokio::test]
    async fn success_is_a_zero_length_frame() {
        let (a, mut b) = duplex(64);
        let mut tx = Handshake::new(a, MigrateRole::Destination);
        tx.send(Message::Success).await.unwrap();
        let mut wire = [0u8; 2];
        b.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [0, 0]);
    }

    #[tokio::test]
    async fn length_is_big_endian() {
        let (a, mut b) = duplex(64);
        let mut tx = Handshake::new(a, MigrateRole::Destination);
        tx.send(Message::Error("ab".to_string())).await.unwrap();
        let mut wire = [0u8; 4];
        b.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [0, 2, b'a', b'b']);
    }

    #[tokio::test]
    async fn short_read_fails() {
        let (mut a, b) = duplex(64);
        let mut rx = Handshake::new(b, MigrateRole::Source);
        // A frame header promising more payload than ever arrives.
        a.write_all(&[0, 5, b'x']).await.unwrap();
        drop(a);
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn closed_peer_fails_recv() {
        let (a, b) = duplex(64);
        drop(a);
        let mut rx = Handshake::new(b, MigrateRole::Source);
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn recv_success_lifts_remote_error() {
        let (a, b) = duplex(64);
        let mut tx = Handshake::new(a, MigrateRole::Destination);
        let mut rx = Handshake::new(b, MigrateRole::Source);
        tx.send(Message::Error("boom".to_string())).await.unwrap();
        match rx.recv_success().await {
            Err(MigrateError::Remote(MigrateRole::Source, msg)) => {
                assert_eq!(msg, "boom")
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_error_text_is_clipped_on_a_char_boundary() {
        let (a, b) = duplex(1 << 17);
        let mut tx = Handshake::new(a, MigrateRole::Destination);
        let mut rx = Handshake::new(b, MigrateRole::Source);
        // Three-byte characters that do not divide u16::MAX evenly.
        let long = "\u{20AC}".repeat(30_000);
        tx.send(Message::Error(long.clone())).await.unwrap();
        match rx.recv().await.unwrap() {
            Message::Error(clipped) => {
                assert!(clipped.len() <= MAX_PAYLOAD);
                assert!(long.starts_with(&clipped));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_do_not_consume_following_image_bytes() {
        let (mut a, b) = duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        a.write_all(b"raw image bytes").await.unwrap();
        let mut rx = Handshake::new(b, MigrateRole::Source);
        assert_eq!(rx.recv().await.unwrap(), Message::Success);
        let mut tail = [0u8; 15];
        rx.inner_mut().read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"raw image bytes");
    }
}
