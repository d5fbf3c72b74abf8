//! Connection classification by peeking at the first bytes.
//!
//! A TLS connection starts with a handshake record (content type `0x16`)
//! carrying a ClientHello; anything else is treated as plaintext. The bytes
//! read while classifying are replayed by [`PeekedStream`], so whoever takes
//! the connection next (TLS acceptor, HTTP server, raw relay) sees the stream
//! from its first byte.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    time::timeout,
};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;
// A ClientHello larger than this is not worth waiting for.
const MAX_HELLO_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClassifyError {
    #[error("no complete ClientHello or plaintext byte within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before it could be classified")]
    Closed,

    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),

    #[error("I/O error while classifying: {0}")]
    Io(#[from] io::Error),
}

/// What the first bytes of a connection revealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A TLS ClientHello, with its SNI if the client sent one (lower-cased).
    Tls { server_name: Option<String> },
    /// Anything that is not a TLS handshake.
    Plain,
}

/// A stream that first yields the bytes consumed during classification.
#[derive(Debug)]
pub struct PeekedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PeekedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.has_remaining() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Reads just enough of `stream` to classify it, giving up after `limit`.
///
/// There is exactly one attempt: on error the stream is dropped, which
/// closes the connection.
pub async fn classify<S: AsyncRead + Unpin>(
    mut stream: S,
    limit: Duration,
) -> Result<(Classification, PeekedStream<S>), ClassifyError> {
    let mut buf = BytesMut::with_capacity(1024);
    let classification = timeout(limit, read_classification(&mut stream, &mut buf))
        .await
        .map_err(|_| ClassifyError::Timeout(limit))??;
    Ok((classification, PeekedStream::new(buf.freeze(), stream)))
}

async fn read_classification<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Classification, ClassifyError> {
    loop {
        if let Some(first) = buf.first() {
            if *first != CONTENT_TYPE_HANDSHAKE {
                return Ok(Classification::Plain);
            }
            if let Some(server_name) = parse_records(buf)? {
                return Ok(Classification::Tls { server_name });
            }
            if buf.len() >= MAX_HELLO_BYTES {
                return Err(ClassifyError::Malformed("ClientHello too large"));
            }
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(if buf.is_empty() {
                ClassifyError::Closed
            } else {
                ClassifyError::Malformed("truncated ClientHello")
            });
        }
    }
}

/// Collects the handshake bytes of the leading records. `Ok(None)` means
/// more input is needed.
fn parse_records(data: &[u8]) -> Result<Option<Option<String>>, ClassifyError> {
    let mut handshake = Vec::new();
    let mut records = Reader::new(data);
    loop {
        if records.remaining() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let content_type = records.u8().ok_or(ClassifyError::Malformed("record header"))?;
        if content_type != CONTENT_TYPE_HANDSHAKE {
            return Err(ClassifyError::Malformed("handshake interleaved with other records"));
        }
        records.take(2).ok_or(ClassifyError::Malformed("record version"))?;
        let len = usize::from(records.u16().ok_or(ClassifyError::Malformed("record length"))?);
        let Some(fragment) = records.take(len) else {
            return Ok(None);
        };
        handshake.extend_from_slice(fragment);

        if handshake.len() >= 4 {
            if handshake[0] != HANDSHAKE_CLIENT_HELLO {
                return Err(ClassifyError::Malformed("first handshake message is not a ClientHello"));
            }
            let body_len = usize::from(handshake[1]) << 16
                | usize::from(handshake[2]) << 8
                | usize::from(handshake[3]);
            if handshake.len() >= 4 + body_len {
                return parse_client_hello(&handshake[4..4 + body_len]).map(Some);
            }
        }
    }
}

fn parse_client_hello(body: &[u8]) -> Result<Option<String>, ClassifyError> {
    let malformed = ClassifyError::Malformed;
    let mut hello = Reader::new(body);
    hello.take(2 + 32).ok_or(malformed("version and random"))?;
    hello.vec8().ok_or(malformed("session id"))?;
    hello.vec16().ok_or(malformed("cipher suites"))?;
    hello.vec8().ok_or(malformed("compression methods"))?;
    if hello.remaining() == 0 {
        return Ok(None);
    }

    let mut extensions = Reader::new(hello.vec16().ok_or(malformed("extensions"))?);
    while extensions.remaining() > 0 {
        let kind = extensions.u16().ok_or(malformed("extension type"))?;
        let data = extensions.vec16().ok_or(malformed("extension data"))?;
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }
        let mut names = Reader::new(Reader::new(data).vec16().ok_or(malformed("server name list"))?);
        while names.remaining() > 0 {
            let name_type = names.u8().ok_or(malformed("server name type"))?;
            let name = names.vec16().ok_or(malformed("server name"))?;
            if name_type == SERVER_NAME_TYPE_HOST {
                let name = std::str::from_utf8(name).map_err(|_| malformed("server name is not UTF-8"))?;
                return Ok(Some(name.to_ascii_lowercase()));
            }
        }
    }
    Ok(None)
}

/// Big-endian cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()?;
        self.take(usize::from(len))
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }
}
