//! Reading heads off a socket and streaming bodies between peers.
//!
//! Every function takes the stream together with the connection's read
//! buffer: bytes read past the end of a head stay in the buffer and are
//! consumed first by whatever reads next.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ServerError;
use crate::http::{BodyKind, Head, HttpError};

const READ_CHUNK: usize = 8 * 1024;
/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 4 * 1024;

async fn fill<S>(stream: &mut S, buf: &mut BytesMut) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin + ?Sized,
{
    buf.reserve(READ_CHUNK);
    stream.read_buf(buf).await
}

/// Read one head.
///
/// Returns `None` when the peer closed before sending anything.
pub async fn read_head<H, S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_len: usize,
) -> Result<Option<H>, ServerError>
where
    H: Head,
    S: AsyncRead + Unpin + ?Sized,
{
    Ok(read_head_raw(stream, buf, max_len).await?.map(|(head, _)| head))
}

/// Like [`read_head`], also returning the head exactly as it was received.
pub async fn read_head_raw<H, S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_len: usize,
) -> Result<Option<(H, BytesMut)>, ServerError>
where
    H: Head,
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if !buf.is_empty() {
            if let Some(head) = H::parse(&buf[..])? {
                if head.wire_len() > max_len {
                    return Err(HttpError::HeadTooLarge(max_len).into());
                }
                let raw = buf.split_to(head.wire_len());
                return Ok(Some((head, raw)));
            }
            if buf.len() >= max_len {
                return Err(HttpError::HeadTooLarge(max_len).into());
            }
        }
        if fill(stream, buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(HttpError::UnexpectedEof.into())
            };
        }
    }
}

/// Read a CRLF-terminated line, terminator included.
async fn read_line<S>(stream: &mut S, buf: &mut BytesMut) -> Result<BytesMut, ServerError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut scanned = 0;
    loop {
        if let Some(pos) = buf[scanned..].windows(2).position(|w| w == b"\r\n") {
            return Ok(buf.split_to(scanned + pos + 2));
        }
        if buf.len() > MAX_LINE {
            return Err(HttpError::BadChunk("line too long".into()).into());
        }
        scanned = buf.len().saturating_sub(1);
        if fill(stream, buf).await? == 0 {
            return Err(HttpError::UnexpectedEof.into());
        }
    }
}

async fn copy_exact<R, W, F>(
    src: &mut R,
    buf: &mut BytesMut,
    dst: &mut W,
    mut remaining: u64,
    record: &mut F,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    while remaining > 0 {
        if buf.is_empty() && fill(src, buf).await? == 0 {
            return Err(HttpError::UnexpectedEof.into());
        }
        let take = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let chunk = buf.split_to(take);
        dst.write_all(&chunk).await?;
        record(take as u64);
        remaining -= take as u64;
    }
    Ok(())
}

fn chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::BadChunk("non-ascii size".into()))?
        .trim_end_matches("\r\n");
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| HttpError::BadChunk(format!("bad size {size:?}")))
}

/// Stream one body from `src` to `dst` verbatim, framing included.
///
/// `record` sees every byte count written to `dst`. Returns the total.
pub async fn copy_body<R, W>(
    src: &mut R,
    buf: &mut BytesMut,
    dst: &mut W,
    kind: BodyKind,
    mut record: impl FnMut(u64),
) -> Result<u64, ServerError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    let mut counted = |n: u64| {
        total += n;
        record(n);
    };

    match kind {
        BodyKind::Empty => {}
        BodyKind::Length(len) => copy_exact(src, buf, dst, len, &mut counted).await?,
        BodyKind::Chunked => loop {
            let line = read_line(src, buf).await?;
            let size = chunk_size(&line)?;
            dst.write_all(&line).await?;
            counted(line.len() as u64);
            if size == 0 {
                // Trailer section ends with an empty line.
                loop {
                    let trailer = read_line(src, buf).await?;
                    dst.write_all(&trailer).await?;
                    counted(trailer.len() as u64);
                    if trailer.len() == 2 {
                        break;
                    }
                }
                break;
            }
            copy_exact(src, buf, dst, size + 2, &mut counted).await?;
        },
        BodyKind::UntilClose => loop {
            if buf.is_empty() && fill(src, buf).await? == 0 {
                break;
            }
            let chunk = buf.split();
            dst.write_all(&chunk).await?;
            counted(chunk.len() as u64);
        },
    }

    dst.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{RequestHead, ResponseHead};

    #[tokio::test]
    async fn reads_pipelined_heads_in_order() {
        let mut src: &[u8] = b"GET http://a/ HTTP/1.1\r\n\r\nGET http://b/ HTTP/1.1\r\n\r\n";
        let mut buf = BytesMut::new();
        let first: RequestHead = read_head(&mut src, &mut buf, 1024).await.unwrap().unwrap();
        let second: RequestHead = read_head(&mut src, &mut buf, 1024).await.unwrap().unwrap();
        assert_eq!(first.target, "http://a/");
        assert_eq!(second.target, "http://b/");
        assert!(
            read_head::<RequestHead, _>(&mut src, &mut buf, 1024)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn raw_head_keeps_reason_phrase() {
        let mut src: &[u8] = b"HTTP/1.1 418 I'm a teapot\r\nX-A: b\r\n\r\nbody";
        let mut buf = BytesMut::new();
        let (head, raw): (ResponseHead, _) = read_head_raw(&mut src, &mut buf, 1024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.status, 418);
        assert_eq!(&raw[..], b"HTTP/1.1 418 I'm a teapot\r\nX-A: b\r\n\r\n");
        assert_eq!(&buf[..], b"body");
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let raw = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(200));
        let mut src = raw.as_bytes();
        let mut buf = BytesMut::new();
        let err = read_head::<RequestHead, _>(&mut src, &mut buf, 64)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Http(HttpError::HeadTooLarge(64))));
    }

    #[tokio::test]
    async fn truncated_head_is_eof_error() {
        let mut src: &[u8] = b"HTTP/1.1 200 OK\r\nContent-";
        let mut buf = BytesMut::new();
        let err = read_head::<ResponseHead, _>(&mut src, &mut buf, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Http(HttpError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn copies_length_body_and_leaves_rest() {
        let mut src: &[u8] = b"world!NEXT";
        let mut buf = BytesMut::from(&b"hello "[..]);
        let mut out = Vec::new();
        let mut seen = 0;
        let n = copy_body(&mut src, &mut buf, &mut out, BodyKind::Length(12), |b| seen += b)
            .await
            .unwrap();
        assert_eq!(n, 12);
        assert_eq!(seen, 12);
        assert_eq!(out, b"hello world!");
        let mut rest = buf.to_vec();
        src.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn copies_chunked_body_verbatim() {
        let body = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut src: &[u8] = &body[..];
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let n = copy_body(&mut src, &mut buf, &mut out, BodyKind::Chunked, |_| {})
            .await
            .unwrap();
        assert_eq!(out, body.to_vec());
        assert_eq!(n, body.len() as u64);
    }

    #[tokio::test]
    async fn bad_chunk_size_fails() {
        let mut src: &[u8] = b"zz\r\n";
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let err = copy_body(&mut src, &mut buf, &mut out, BodyKind::Chunked, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Http(HttpError::BadChunk(_))));
    }

    #[tokio::test]
    async fn until_close_drains_everything() {
        let mut src: &[u8] = b" tail";
        let mut buf = BytesMut::from(&b"head"[..]);
        let mut out = Vec::new();
        copy_body(&mut src, &mut buf, &mut out, BodyKind::UntilClose, |_| {})
            .await
            .unwrap();
        assert_eq!(out, b"head tail");
    }

    #[tokio::test]
    async fn short_length_body_is_eof_error() {
        let mut src: &[u8] = b"abc";
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let err = copy_body(&mut src, &mut buf, &mut out, BodyKind::Length(10), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Http(HttpError::UnexpectedEof)));
    }
}
