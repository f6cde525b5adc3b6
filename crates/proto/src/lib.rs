//! Wire envelope and framing for the proxy control/data plane.
//!
//! Every unit exchanged over a multiplexed stream is an [`Envelope`],
//! serialized with a field-tagged binary encoding and framed with a
//! 4-byte big-endian length prefix. Field numbers, not declaration
//! order, govern wire compatibility across versions.

use std::io;

use bytes::{BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

include!(concat!(env!("OUT_DIR"), "/bproxy.proto.rs"));

/// Frames larger than this are refused before the length-prefixed
/// payload is even allocated, bounding how much a hostile peer can
/// force us to buffer for a single envelope.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    ShortRead,
    DecodeError,
    FrameTooLarge(u32),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::ShortRead => write!(f, "connection closed before a full frame was read"),
            Self::DecodeError => write!(f, "malformed envelope payload"),
            Self::FrameTooLarge(len) => write!(f, "frame of {len} bytes exceeds MAX_FRAME_LEN"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::UnexpectedEof => Self::ShortRead,
            _ => Self::Io(value),
        }
    }
}

impl Envelope {
    pub fn new(kind: MessageType, source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            r#type: kind as i32,
            session_id: String::new(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            timestamp: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_payload<T: Message>(mut self, payload: &T) -> Self {
        self.payload = payload.encode_to_vec();
        self
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.r#type).ok()
    }

    pub fn decode_payload<T: Message + Default>(&self) -> Result<T, Error> {
        T::decode(self.payload.as_slice()).map_err(|_| Error::DecodeError)
    }
}

/// Writes a single length-prefixed, encoded envelope to `writer`.
pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<(), Error> {
    let body = envelope.encode_to_vec();
    let len = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }

    let mut framed = BytesMut::with_capacity(4 + body.len());
    framed.put_u32(len);
    framed.extend_from_slice(&body);
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a single length-prefixed envelope from `reader`.
///
/// # Test
///
/// ```no_run
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// use bproxy_proto::{Envelope, MessageType, read_envelope, write_envelope};
/// use tokio::io::duplex;
///
/// let (mut a, mut b) = duplex(4096);
/// let sent = Envelope::new(MessageType::Heartbeat, "agent-1", "admin");
/// write_envelope(&mut a, &sent).await?;
/// let received = read_envelope(&mut b).await?;
/// assert_eq!(sent.source_id, received.source_id);
/// # Ok(())
/// # }
/// ```
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, Error> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let mut cursor = body.as_slice();
    Envelope::decode(&mut cursor).map_err(|_| Error::DecodeError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_an_envelope() {
        let (mut a, mut b) = duplex(4096);
        let sent = Envelope::new(MessageType::Command, "admin", "agent-1")
            .with_payload(&CommandPayload { command: "whoami".into(), args: vec![] });

        write_envelope(&mut a, &sent).await.unwrap();
        let received = read_envelope(&mut b).await.unwrap();

        assert_eq!(received.kind(), Some(MessageType::Command));
        assert_eq!(received.target_id, "agent-1");
        let payload: CommandPayload = received.decode_payload().unwrap();
        assert_eq!(payload.command, "whoami");
    }

    #[tokio::test]
    async fn short_read_is_reported_distinctly() {
        let (mut a, b) = duplex(4096);
        a.write_all(&6u32.to_be_bytes()).await.unwrap();
        a.write_all(b"ab").await.unwrap();
        drop(a);

        let mut b = b;
        let err = read_envelope(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::ShortRead));
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_before_reading_body() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).await.unwrap();

        let err = read_envelope(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(_)));
    }

    #[test]
    fn decode_error_is_distinct_from_short_read() {
        let garbage = Envelope {
            r#type: 0,
            session_id: String::new(),
            source_id: String::new(),
            target_id: String::new(),
            timestamp: 0,
            payload: vec![0xff, 0xff, 0xff],
        };
        let payload: Result<RegisterPayload, Error> = garbage.decode_payload();
        assert!(payload.is_err());
    }
}
