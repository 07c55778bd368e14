//! Glues a `DecryptedReader`/`EncryptedWriter` pair from the
//! `shadowsocks` crate onto a single duplex stream, so the relay
//! engine (C4) can drive client and upstream sides uniformly.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use shadowsocks::{DecryptedReader, EncryptedWriter};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct CipherStream<S> {
    stream: S,
    reader: DecryptedReader,
    writer: EncryptedWriter,
}

impl<S> CipherStream<S> {
    pub fn new(stream: S, reader: DecryptedReader, writer: EncryptedWriter) -> Self {
        Self {
            stream,
            reader,
            writer,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S> AsyncRead for CipherStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.reader
            .poll_read_decrypted(cx, &mut this.stream, buf)
            .map_err(io::Error::from)
    }
}

impl<S> AsyncWrite for CipherStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.writer.poll_write_encrypted(cx, &mut this.stream, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
