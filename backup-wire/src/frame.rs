//! Length-prefixed framing over any async byte stream.
//!
//! ```text
//! +----------+------------------+
//! | 00000005 | hello            |
//! +----------+------------------+
//!   8 ASCII    L payload bytes
//!   digits
//! ```
//!
//! Text and binary frames share the format. Binary payloads are streamed in
//! fixed-size chunks so an archive never has to fit in memory.

use std::io::ErrorKind;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{io_err, socket_err, WireError};

pub const HEADER_LEN: usize = 8;
/// Largest payload an 8-digit header can describe.
pub const MAX_FRAME_LEN: u64 = 99_999_999;
const CHUNK_SIZE: usize = 64 * 1024;

/// Render `len` as the 8-digit zero-padded header.
pub fn encode_header(len: u64) -> Result<[u8; HEADER_LEN], WireError> {
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge { len });
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(format!("{len:08}").as_bytes());
    Ok(header)
}

pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<u64, WireError> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(WireError::MalformedFrame(format!(
            "non-decimal header {:?}",
            String::from_utf8_lossy(header)
        )));
    }
    Ok(header
        .iter()
        .fold(0u64, |acc, digit| acc * 10 + u64::from(digit - b'0')))
}

/// A stream wrapped with the frame codec.
#[derive(Debug)]
pub struct FrameTransport<S> {
    stream: S,
}

impl FrameTransport<TcpStream> {
    /// Open a TCP connection to `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self, WireError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| WireError::Connect { addr, source })?;
        Ok(Self::new(stream))
    }
}

impl<S> FrameTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), WireError> {
        self.send_bytes(text.as_bytes()).await
    }

    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<(), WireError> {
        let header = encode_header(payload.len() as u64)?;
        self.stream.write_all(&header).await.map_err(socket_err)?;
        self.stream.write_all(payload).await.map_err(socket_err)?;
        self.stream.flush().await.map_err(socket_err)?;
        Ok(())
    }

    pub async fn receive_text(&mut self) -> Result<String, WireError> {
        let len = self.read_header().await?;
        let mut payload = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| short_read(err, len))?;
        String::from_utf8(payload)
            .map_err(|err| WireError::MalformedFrame(format!("payload is not UTF-8: {err}")))
    }

    /// Stream the file at `path` as one binary frame. Returns its size.
    pub async fn send_file(&mut self, path: &Path) -> Result<u64, WireError> {
        let mut file = File::open(path).await.map_err(|e| io_err(path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| io_err(path, e))?
            .len();
        let header = encode_header(size)?;
        self.stream.write_all(&header).await.map_err(socket_err)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let read = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| io_err(path, e))?;
            if read == 0 {
                return Err(io_err(
                    path,
                    std::io::Error::new(ErrorKind::UnexpectedEof, "file shrank while sending"),
                ));
            }
            self.stream
                .write_all(&buf[..read])
                .await
                .map_err(socket_err)?;
            remaining -= read as u64;
        }
        self.stream.flush().await.map_err(socket_err)?;
        tracing::debug!(path = %path.display(), bytes = size, "file frame sent");
        Ok(size)
    }

    /// Receive one binary frame into `sink`. Returns the payload size.
    pub async fn receive_file<W>(&mut self, sink: &mut W) -> Result<u64, WireError>
    where
        W: AsyncWrite + Unpin,
    {
        let len = self.read_header().await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(CHUNK_SIZE as u64) as usize;
            let read = self
                .stream
                .read(&mut buf[..want])
                .await
                .map_err(socket_err)?;
            if read == 0 {
                return Err(WireError::MalformedFrame(format!(
                    "stream ended {remaining} bytes short of a {len}-byte payload"
                )));
            }
            sink.write_all(&buf[..read]).await.map_err(WireError::Sink)?;
            remaining -= read as u64;
        }
        sink.flush().await.map_err(WireError::Sink)?;
        Ok(len)
    }

    /// Drop the connection without a shutdown handshake.
    pub fn abort(self) {
        drop(self.stream);
    }

    /// Half-close the write side, then drop.
    pub async fn close(mut self) -> Result<(), WireError> {
        self.stream.shutdown().await.map_err(socket_err)
    }

    async fn read_header(&mut self) -> Result<u64, WireError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let read = self
                .stream
                .read(&mut header[filled..])
                .await
                .map_err(socket_err)?;
            if read == 0 {
                return Err(if filled == 0 {
                    WireError::PeerClosed
                } else {
                    WireError::MalformedFrame(format!(
                        "truncated header ({filled} of {HEADER_LEN} bytes)"
                    ))
                });
            }
            filled += read;
        }
        decode_header(&header)
    }
}

fn short_read(err: std::io::Error, len: u64) -> WireError {
    if err.kind() == ErrorKind::UnexpectedEof {
        WireError::MalformedFrame(format!("stream ended inside a {len}-byte payload"))
    } else {
        socket_err(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (
        FrameTransport<tokio::io::DuplexStream>,
        FrameTransport<tokio::io::DuplexStream>,
    ) {
        let (a, b) = duplex(256 * 1024);
        (FrameTransport::new(a), FrameTransport::new(b))
    }

    #[test]
    fn header_is_eight_zero_padded_digits() {
        assert_eq!(&encode_header(5).unwrap(), b"00000005");
        assert_eq!(&encode_header(MAX_FRAME_LEN).unwrap(), b"99999999");
        assert!(matches!(
            encode_header(MAX_FRAME_LEN + 1),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn header_rejects_non_digits() {
        assert!(matches!(
            decode_header(b"0000 012"),
            Err(WireError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_header(b"-0000001"),
            Err(WireError::MalformedFrame(_))
        ));
        assert_eq!(decode_header(b"00000000").unwrap(), 0);
    }

    #[tokio::test]
    async fn text_frame_on_the_wire() {
        let (mut tx, rx) = pair();
        tx.send_text("hello").await.unwrap();
        drop(tx);
        let mut raw = rx.into_inner();
        let mut bytes = Vec::new();
        raw.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"00000005hello");
    }

    #[tokio::test]
    async fn text_frames_in_sequence() {
        let (mut tx, mut rx) = pair();
        tx.send_text("DIFF").await.unwrap();
        tx.send_text("").await.unwrap();
        tx.send_text("héllo").await.unwrap();
        assert_eq!(rx.receive_text().await.unwrap(), "DIFF");
        assert_eq!(rx.receive_text().await.unwrap(), "");
        assert_eq!(rx.receive_text().await.unwrap(), "héllo");
    }

    #[tokio::test]
    async fn reply_then_checksum_against_scripted_peer() {
        let mock = tokio_test::io::Builder::new()
            .read(b"00000004DIFF")
            .read(b"00000003abc")
            .read(b"00000002ok")
            .write(b"00000007request")
            .build();
        let mut transport = FrameTransport::new(mock);

        assert_eq!(transport.receive_text().await.unwrap(), "DIFF");
        let mut archive = Vec::new();
        assert_eq!(transport.receive_file(&mut archive).await.unwrap(), 3);
        assert_eq!(archive, b"abc");
        assert_eq!(transport.receive_text().await.unwrap(), "ok");
        transport.send_text("request").await.unwrap();
    }

    #[tokio::test]
    async fn eof_before_header_is_peer_closed() {
        let (tx, mut rx) = pair();
        drop(tx);
        assert!(matches!(rx.receive_text().await, Err(WireError::PeerClosed)));
    }

    #[tokio::test]
    async fn truncated_header_is_malformed() {
        let (a, b) = duplex(64);
        let mut raw = a;
        raw.write_all(b"0000").await.unwrap();
        drop(raw);
        let mut rx = FrameTransport::new(b);
        assert!(matches!(
            rx.receive_text().await,
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn short_payload_is_malformed() {
        let (a, b) = duplex(64);
        let mut raw = a;
        raw.write_all(b"00000010abc").await.unwrap();
        drop(raw);
        let mut rx = FrameTransport::new(b);
        assert!(matches!(
            rx.receive_text().await,
            Err(WireError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn file_frame_streams_in_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("archive.tar.gz");
        let data: Vec<u8> = (0..CHUNK_SIZE * 3 + 123).map(|i| (i % 253) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let (mut tx, mut rx) = pair();
        let sender = tokio::spawn(async move {
            let sent = tx.send_file(&source).await.unwrap();
            tx.send_text("trailer").await.unwrap();
            sent
        });

        let mut received = Vec::new();
        let len = rx.receive_file(&mut received).await.unwrap();
        let trailer = rx.receive_text().await.unwrap();

        assert_eq!(sender.await.unwrap(), data.len() as u64);
        assert_eq!(len, data.len() as u64);
        assert_eq!(received, data);
        assert_eq!(trailer, "trailer");
    }

    #[tokio::test]
    async fn truncated_file_frame_is_malformed() {
        let (a, b) = duplex(64);
        let mut raw = a;
        raw.write_all(b"00000100partial").await.unwrap();
        drop(raw);
        let mut rx = FrameTransport::new(b);
        let mut sink = Vec::new();
        assert!(matches!(
            rx.receive_file(&mut sink).await,
            Err(WireError::MalformedFrame(_))
        ));
        assert_eq!(sink, b"partial");
    }

    #[tokio::test]
    async fn missing_file_reports_path() {
        let (mut tx, _rx) = pair();
        let err = tx.send_file(Path::new("/nonexistent/archive")).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/archive"), "got: {err}");
    }
}
