//! Cipher-trial identification: pick which candidate key a new
//! connection belongs to by attempting AEAD authentication of its
//! first length frame, in list order, without losing any byte pulled
//! off the wire along the way.

use std::future::poll_fn;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::cipher_list::CipherList;
use crate::tcp::aead::{DecryptedReader, ProtocolError};

#[derive(thiserror::Error, Debug)]
pub enum TrialError {
    #[error("cipher list must not be empty")]
    EmptyCipherList,
    #[error("connection closed before any candidate cipher authenticated")]
    Eof,
    #[error("no candidate cipher authenticated the connection")]
    NoMatch,
}

/// Replay-then-tee reader: replays a snapshot of previously consumed
/// bytes first, then reads fresh bytes from the raw stream while
/// appending every fresh byte to the shared growing buffer so later
/// trials can see it too.
///
/// This is the one concrete type the trial loop needs instead of a
/// deep stack of generic adapters — the buffer is a plain field, not
/// another type parameter.
struct ReplayTee<'a, S: ?Sized> {
    replayed: Bytes,
    pos: usize,
    raw: &'a mut S,
    tee: &'a mut BytesMut,
}

impl<'a, S> AsyncRead for ReplayTee<'a, S>
where
    S: AsyncRead + Unpin + ?Sized,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.replayed.len() {
            let remaining = &this.replayed[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut *this.raw).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.tee.extend_from_slice(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// A stream whose first bytes are replayed from a buffered prefix
/// before falling through to an inner stream. Used as the client
/// stream once identification has finished: `prefix` holds whatever
/// was pulled off the wire during trials, and reads transparently
/// continue on `inner` once the prefix is exhausted. Writes pass
/// straight through.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> AsyncRead for PrefixedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PrefixedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Outcome of a successful identification.
pub struct Identified<S> {
    pub index: usize,
    pub reader: DecryptedReader,
    pub stream: PrefixedStream<S>,
}

/// Attempt to identify which cipher in `list` a freshly accepted
/// connection belongs to. See module docs and the cipher-trial
/// algorithm in the design document for the buffering discipline.
pub async fn identify<S>(stream: S, list: &CipherList) -> Result<Identified<S>, TrialError>
where
    S: AsyncRead + Unpin,
{
    if list.is_empty() {
        return Err(TrialError::EmptyCipherList);
    }

    if list.len() == 1 {
        let entry = list.get(0).expect("len() == 1");
        let reader = DecryptedReader::new(entry.kind(), entry.master_key());
        return Ok(Identified {
            index: 0,
            reader,
            stream: PrefixedStream::new(Bytes::new(), stream),
        });
    }

    let mut stream = stream;
    let mut buffer = BytesMut::new();

    for (index, entry) in list.iter() {
        let replayed = Bytes::copy_from_slice(&buffer);
        let mut trial_reader = DecryptedReader::new(entry.kind(), entry.master_key());
        let mut trial = ReplayTee {
            replayed,
            pos: 0,
            raw: &mut stream,
            tee: &mut buffer,
        };

        match poll_fn(|cx| trial_reader.poll_authenticate(cx, &mut trial)).await {
            Ok(()) => {
                let prefix = buffer.split().freeze();
                let reader = DecryptedReader::new(entry.kind(), entry.master_key());
                return Ok(Identified {
                    index,
                    reader,
                    stream: PrefixedStream::new(prefix, stream),
                });
            }
            Err(ProtocolError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(TrialError::Eof);
            }
            Err(_) => continue,
        }
    }

    Err(TrialError::NoMatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher_list::CipherEntry;
    use crate::crypto::CipherKind;
    use crate::tcp::aead::EncryptedWriter;

    fn make_list(secrets: &[(&str, &str)]) -> CipherList {
        let entries = secrets
            .iter()
            .map(|(kind, secret)| {
                let kind: CipherKind = kind.parse().unwrap();
                CipherEntry::new(kind, secret.as_bytes())
            })
            .collect();
        CipherList::new(entries).unwrap()
    }

    async fn encrypt_under(kind: CipherKind, secret: &str, plaintext: &[u8]) -> Vec<u8> {
        let master = crate::crypto::derive_master_key(secret.as_bytes(), kind.key_len());
        let salt = vec![0xABu8; kind.salt_len()];
        let mut writer = EncryptedWriter::new(kind, &master, &salt);

        let mut out = Vec::new();
        let mut written = 0;
        while written < plaintext.len() {
            let n = poll_fn(|cx| writer.poll_write_encrypted(cx, &mut out, &plaintext[written..]))
                .await
                .unwrap();
            written += n;
        }
        out
    }

    #[tokio::test]
    async fn single_cipher_skips_trial() {
        let list = make_list(&[("aes-128-gcm", "only-secret")]);
        let wire = encrypt_under(CipherKind::Aes128Gcm, "only-secret", b"hi").await;

        let identified = identify(wire.as_slice(), &list).await.unwrap();
        assert_eq!(identified.index, 0);
    }

    #[tokio::test]
    async fn selects_last_cipher_in_list() {
        let list = make_list(&[
            ("aes-128-gcm", "zero"),
            ("aes-256-gcm", "one"),
            ("chacha20-poly1305", "two"),
        ]);

        let wire = encrypt_under(CipherKind::ChaCha20Poly1305, "two", b"payload").await;

        let mut identified = identify(wire.as_slice(), &list).await.unwrap();
        assert_eq!(identified.index, 2);

        let mut out = vec![0u8; b"payload".len()];
        let mut read_buf = ReadBuf::new(&mut out);
        poll_fn(|cx| {
            identified
                .reader
                .poll_read_decrypted(cx, &mut identified.stream, &mut read_buf)
        })
        .await
        .unwrap();
        assert_eq!(read_buf.filled(), b"payload");
    }

    #[tokio::test]
    async fn no_match_reports_no_match_not_eof() {
        let list = make_list(&[("aes-128-gcm", "zero"), ("aes-256-gcm", "one")]);
        let garbage = vec![0x42u8; 64];

        let err = identify(garbage.as_slice(), &list).await.unwrap_err();
        assert!(matches!(err, TrialError::NoMatch));
    }

    #[tokio::test]
    async fn eof_mid_trial_aborts_immediately() {
        let list = make_list(&[("aes-128-gcm", "zero"), ("aes-256-gcm", "one")]);
        let short = vec![0x01u8; 3];

        let err = identify(short.as_slice(), &list).await.unwrap_err();
        assert!(matches!(err, TrialError::Eof));
    }

    #[tokio::test]
    async fn preserves_bytes_across_failed_trials() {
        let list = make_list(&[
            ("aes-128-gcm", "wrong-a"),
            ("aes-256-gcm", "wrong-b"),
            ("chacha20-poly1305", "right"),
        ]);

        let plaintext = b"the quick brown fox";
        let wire = encrypt_under(CipherKind::ChaCha20Poly1305, "right", plaintext).await;

        let mut identified = identify(wire.as_slice(), &list).await.unwrap();
        assert_eq!(identified.index, 2);

        let mut out = vec![0u8; plaintext.len()];
        let mut read_buf = ReadBuf::new(&mut out);
        poll_fn(|cx| {
            identified
                .reader
                .poll_read_decrypted(cx, &mut identified.stream, &mut read_buf)
        })
        .await
        .unwrap();
        assert_eq!(read_buf.filled(), plaintext);
    }
}
