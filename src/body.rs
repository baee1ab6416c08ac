//! Message body transfer: the DATA dot-unstuffing reader and the BDAT
//! chunk pump.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures::Stream;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::codec::Framed;

use crate::line::LineCodec;
use crate::reply::Reply;

/// Returned by [`DataReader`] when the message exceeds the configured
/// `max_message_bytes`; mapped to `552 5.3.4` by the caller.
#[derive(Debug, thiserror::Error)]
#[error("message exceeds the configured size limit")]
pub struct SizeExceeded;

/// Wraps a line-mode `Framed` transport, presenting the DATA body as a
/// plain `AsyncRead`: leading-dot transparency is undone, the lone-dot
/// terminator line ends the stream, and `max_message_bytes` is enforced.
pub struct DataReader<'a, T> {
    framed: &'a mut Framed<T, LineCodec>,
    leftover: BytesMut,
    done: bool,
    bytes_seen: usize,
    max_message_bytes: usize,
}

impl<'a, T> DataReader<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(framed: &'a mut Framed<T, LineCodec>, max_message_bytes: usize) -> Self {
        DataReader {
            framed,
            leftover: BytesMut::new(),
            done: false,
            bytes_seen: 0,
            max_message_bytes,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<'a, T> AsyncRead for DataReader<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.leftover.is_empty() {
                let take = std::cmp::min(this.leftover.len(), buf.remaining());
                buf.put_slice(&this.leftover[..take]);
                this.leftover.advance(take);
                return Poll::Ready(Ok(()));
            }

            if this.done {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut *this.framed).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
                Poll::Ready(Some(Ok(mut line))) => {
                    if &line[..] == b".\r\n" || &line[..] == b".\n" {
                        this.done = true;
                        continue;
                    }
                    if line.starts_with(b".") {
                        line.advance(1);
                    }

                    this.bytes_seen += line.len();
                    if this.max_message_bytes > 0 && this.bytes_seen > this.max_message_bytes {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, SizeExceeded)));
                    }

                    this.leftover = line;
                }
            }
        }
    }
}

/// Streams exactly `size` bytes of a BDAT chunk from the wire into `sink`,
/// switching the transport's codec into raw-chunk mode for the duration.
pub async fn copy_bdat_chunk<T, W>(
    framed: &mut Framed<T, LineCodec>,
    size: u64,
    sink: &mut W,
) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    if size == 0 {
        return Ok(());
    }

    framed.codec_mut().chunking_mode(size);

    // A write failure (the backend closed its end of the pipe early) does
    // not short-circuit the loop: the remaining wire bytes of this chunk
    // are still drained so the next command the client sends is read as a
    // command and not as leftover chunk payload. The write error, if any,
    // is reported once draining completes.
    let mut write_err = None;
    loop {
        match futures::StreamExt::next(framed).await {
            Some(Ok(chunk)) => {
                if write_err.is_none() {
                    if let Err(e) = sink.write_all(&chunk).await {
                        write_err = Some(e);
                    }
                }
            }
            Some(Err(crate::line::LineError::ChunkingDone)) => break,
            Some(Err(e)) => return Err(io::Error::new(io::ErrorKind::Other, e)),
            None => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-chunk")),
        }
    }

    match write_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Replies the codec can't express directly (kept here since both the DATA
/// and BDAT paths need a "discard the rest" step before answering).
pub async fn drain_to_end<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<u64> {
    tokio::io::copy(r, &mut tokio::io::sink()).await
}

pub fn syntax_error_reply() -> Reply {
    Reply::new(500, None, "Syntax error")
}
