//! Bidirectional relay engine: copy two duplex streams concurrently
//! until both directions have closed cleanly, or report the first
//! error. Each direction half-closes its write side on a clean read
//! EOF so the peer observes end-of-stream independently of the other
//! direction's progress.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const BUFFER_SIZE: usize = 16 * 1024;

struct CopyBuffer {
    read_done: bool,
    pos: usize,
    cap: usize,
    buf: Box<[u8]>,
}

impl CopyBuffer {
    fn new() -> Self {
        Self {
            read_done: false,
            pos: 0,
            cap: 0,
            buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            if self.pos == self.cap && !self.read_done {
                let mut buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut buf) {
                    Poll::Ready(Ok(())) => {
                        let n = buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.pos = 0;
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            while self.pos < self.cap {
                let n = ready!(writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                self.pos += n;
            }

            if self.read_done && self.pos == self.cap {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

#[derive(PartialEq, Eq)]
enum DirectionState {
    Running,
    ShuttingDown,
    Done,
}

fn transfer_one_direction<R, W>(
    cx: &mut Context<'_>,
    state: &mut DirectionState,
    buf: &mut CopyBuffer,
    r: &mut R,
    w: &mut W,
) -> Poll<io::Result<()>>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut r = Pin::new(r);
    let mut w = Pin::new(w);

    loop {
        match state {
            DirectionState::Running => {
                ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()))?;
                *state = DirectionState::ShuttingDown;
            }
            DirectionState::ShuttingDown => {
                ready!(w.as_mut().poll_shutdown(cx))?;
                *state = DirectionState::Done;
            }
            DirectionState::Done => return Poll::Ready(Ok(())),
        }
    }
}

struct Relay<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_buf: CopyBuffer,
    b_buf: CopyBuffer,
    a_to_b: DirectionState,
    b_to_a: DirectionState,
}

impl<A, B> Future for Relay<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let a_to_b = transfer_one_direction(
            cx,
            &mut this.a_to_b,
            &mut this.a_buf,
            &mut *this.a,
            &mut *this.b,
        );
        let b_to_a = transfer_one_direction(
            cx,
            &mut this.b_to_a,
            &mut this.b_buf,
            &mut *this.b,
            &mut *this.a,
        );

        match (a_to_b, b_to_a) {
            (Poll::Ready(Err(e)), _) | (_, Poll::Ready(Err(e))) => Poll::Ready(Err(e)),
            (Poll::Ready(Ok(())), Poll::Ready(Ok(()))) => Poll::Ready(Ok(())),
            _ => Poll::Pending,
        }
    }
}

/// Relay traffic between two duplex streams ("two half-pipes") until
/// both directions finish cleanly, or return the first error either
/// direction raised.
pub async fn thp<A, B>(a: &mut A, b: &mut B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Relay {
        a,
        b,
        a_buf: CopyBuffer::new(),
        b_buf: CopyBuffer::new(),
        a_to_b: DirectionState::Running,
        b_to_a: DirectionState::Running,
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_until_both_sides_close() {
        let (mut client_a, mut proxy_a) = tokio::io::duplex(64);
        let (mut proxy_b, mut client_b) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move { thp(&mut proxy_a, &mut proxy_b).await });

        client_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client_b.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_a);
        drop(client_b);

        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn propagates_read_error() {
        struct FailingReader;
        impl AsyncRead for FailingReader {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "boom")))
            }
        }
        impl AsyncWrite for FailingReader {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let (mut a, mut b) = tokio::io::duplex(64);
        let mut failing = FailingReader;
        let err = thp(&mut a, &mut failing).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        drop(b);
    }
}
