//! AEAD packet I/O facilities
//!
//! AEAD framing is defined in <https://shadowsocks.org/en/spec/AEAD.html>.
//!
//! ```plain
//! TCP Chunk (before encryption)
//! +----------+
//! |  DATA    |
//! +----------+
//! | Variable |
//! +----------+
//!
//! TCP Chunk (after encryption, *ciphertext*)
//! +--------------+---------------+--------------+------------+
//! |  *DataLen*   |  DataLen_TAG  |    *Data*    |  Data_TAG  |
//! +--------------+---------------+--------------+------------+
//! |      2       |     Fixed     |   Variable   |   Fixed    |
//! +--------------+---------------+--------------+------------+
//! ```
//!
//! A per-connection salt precedes the first frame. `DecryptedReader`
//! and `EncryptedWriter` are generic over any `AsyncRead`/`AsyncWrite`
//! so the cipher-trial identifier (see `tcp::trial`) can drive them
//! over a synthetic replay-then-tee reader before the real socket is
//! ever touched by the selected cipher.

use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{self, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{Cipher, CipherKind};

/// AEAD packet payload must be smaller than 0x3FFF.
pub const MAX_PACKET_SIZE: usize = 0x3FFF;

/// AEAD protocol error.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("decrypt data failed, authentication tag mismatch")]
    DecryptDataError,
    #[error("decrypt length failed, authentication tag mismatch")]
    DecryptLengthError,
    #[error("frame size too large ({0:#x}), must be smaller than 0x3FFF")]
    DataTooLong(usize),
}

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> io::Error {
        match e {
            ProtocolError::IoError(err) => err,
            other => io::Error::new(ErrorKind::Other, other),
        }
    }
}

enum DecryptReadState {
    WaitSalt,
    ReadLength,
    ReadData { length: usize },
    BufferedData { pos: usize },
}

/// Reader wrapper that decrypts an AEAD-framed stream on demand.
pub struct DecryptedReader {
    state: DecryptReadState,
    kind: CipherKind,
    master_key: Bytes,
    cipher: Option<Cipher>,
    buffer: BytesMut,
    salt: Option<Bytes>,
}

impl DecryptedReader {
    pub fn new(kind: CipherKind, master_key: &[u8]) -> DecryptedReader {
        Self {
            state: DecryptReadState::WaitSalt,
            kind,
            master_key: Bytes::copy_from_slice(master_key),
            cipher: None,
            buffer: BytesMut::with_capacity(kind.salt_len()),
            salt: None,
        }
    }

    /// Salt read from the peer, once the handshake has progressed past it.
    pub fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }

    /// Read one frame, driving `buf` only once a full payload frame has
    /// been decrypted.
    pub fn poll_read_decrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), ProtocolError>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        if buf.remaining() == 0 {
            return Ok(()).into();
        }

        loop {
            match self.state {
                DecryptReadState::WaitSalt => {
                    ready!(self.poll_read_salt(cx, stream))?;

                    self.state = DecryptReadState::ReadLength;
                    self.buffer.clear();
                    self.buffer.reserve(2 + self.kind.tag_len());
                }

                DecryptReadState::ReadLength => match ready!(self.poll_read_length(cx, stream))? {
                    None => return Ok(()).into(),
                    Some(length) => {
                        self.buffer.clear();
                        self.buffer.reserve(length + self.kind.tag_len());
                        self.state = DecryptReadState::ReadData { length };
                    }
                },

                DecryptReadState::ReadData { length } => {
                    ready!(self.poll_read_data(cx, stream, length))?;
                    self.state = DecryptReadState::BufferedData { pos: 0 };
                }

                DecryptReadState::BufferedData { ref mut pos } => {
                    if *pos < self.buffer.len() {
                        let remaining = &self.buffer[*pos..];
                        let consumed = usize::min(remaining.len(), buf.remaining());
                        buf.put_slice(&remaining[..consumed]);
                        *pos += consumed;

                        return Ok(()).into();
                    }

                    self.buffer.clear();
                    self.buffer.reserve(2 + self.kind.tag_len());
                    self.state = DecryptReadState::ReadLength;
                }
            }
        }
    }

    /// Authenticate the first length frame without delivering any
    /// plaintext to a caller. This is the named primitive the
    /// cipher-trial identifier uses instead of overloading a
    /// zero-length generic read: on success, the reader's state is
    /// left at `ReadData`, ready to decrypt the payload frame on the
    /// next `poll_read_decrypted` call. Must only be called on a
    /// freshly constructed reader (before any byte has been consumed).
    pub fn poll_authenticate<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
    ) -> Poll<Result<(), ProtocolError>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        loop {
            match self.state {
                DecryptReadState::WaitSalt => {
                    ready!(self.poll_read_salt(cx, stream))?;

                    self.state = DecryptReadState::ReadLength;
                    self.buffer.clear();
                    self.buffer.reserve(2 + self.kind.tag_len());
                }

                DecryptReadState::ReadLength => {
                    let length = ready!(self.poll_read_length(cx, stream))?
                        .ok_or(ProtocolError::IoError(ErrorKind::UnexpectedEof.into()))?;

                    self.buffer.clear();
                    self.buffer.reserve(length + self.kind.tag_len());
                    self.state = DecryptReadState::ReadData { length };

                    return Ok(()).into();
                }

                DecryptReadState::ReadData { .. } | DecryptReadState::BufferedData { .. } => {
                    unreachable!("poll_authenticate called on a reader past its first frame")
                }
            }
        }
    }

    fn poll_read_salt<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
    ) -> Poll<Result<(), ProtocolError>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let salt_len = self.kind.salt_len();
        let n = ready!(self.poll_fill_buffer(cx, stream, salt_len))?;
        if n == 0 {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into()).into();
        }

        let salt = Bytes::copy_from_slice(&self.buffer[..salt_len]);
        let subkey = crate::crypto::derive_subkey(&self.master_key, &salt, self.kind.key_len());
        self.cipher = Some(Cipher::new(self.kind, &subkey));
        self.salt = Some(salt);

        Ok(()).into()
    }

    fn poll_read_length<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
    ) -> Poll<Result<Option<usize>, ProtocolError>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let length_size = 2 + self.kind.tag_len();
        let n = ready!(self.poll_fill_buffer(cx, stream, length_size))?;
        if n == 0 {
            return Ok(None).into();
        }

        let cipher = self.cipher.as_mut().expect("salt already consumed");
        let m = &mut self.buffer[..length_size];
        if !cipher.decrypt(m) {
            return Err(ProtocolError::DecryptLengthError).into();
        }

        let length = u16::from_be_bytes([m[0], m[1]]) as usize;
        if length > MAX_PACKET_SIZE {
            return Err(ProtocolError::DataTooLong(length)).into();
        }

        Ok(Some(length)).into()
    }

    fn poll_read_data<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        length: usize,
    ) -> Poll<Result<(), ProtocolError>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let data_len = length + self.kind.tag_len();
        let n = ready!(self.poll_fill_buffer(cx, stream, data_len))?;
        if n == 0 {
            return Err(io::Error::from(ErrorKind::UnexpectedEof).into()).into();
        }

        let cipher = self.cipher.as_mut().expect("salt already consumed");
        let m = &mut self.buffer[..data_len];
        if !cipher.decrypt(m) {
            return Err(ProtocolError::DecryptDataError).into();
        }

        self.buffer.truncate(length);
        Ok(()).into()
    }

    /// Fill `self.buffer` up to `size` bytes from `stream`. Returns the
    /// total bytes filled (`size` on success, `0` on a clean EOF before
    /// any byte was read).
    fn poll_fill_buffer<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        size: usize,
    ) -> Poll<io::Result<usize>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        if size == 0 {
            return Ok(0).into();
        }

        while self.buffer.len() < size {
            let remaining = size - self.buffer.len();
            self.buffer.reserve(remaining);

            let chunk = unsafe { self.buffer.chunk_mut().as_uninit_slice_mut() };
            let mut read_buf = ReadBuf::uninit(chunk);
            let mut read_buf = read_buf.take(remaining);
            ready!(Pin::new(&mut *stream).poll_read(cx, &mut read_buf))?;

            let n = read_buf.filled().len();
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(0).into();
                }
                return Err(ErrorKind::UnexpectedEof.into()).into();
            }

            unsafe {
                self.buffer.advance_mut(n);
            }
        }

        Ok(size).into()
    }
}

enum EncryptWriteState {
    AssemblePacket,
    Writing { pos: usize },
}

/// Writer wrapper that encrypts plaintext writes into AEAD frames.
pub struct EncryptedWriter {
    cipher: Cipher,
    buffer: BytesMut,
    state: EncryptWriteState,
    salt: Bytes,
}

impl EncryptedWriter {
    /// Creates a new `EncryptedWriter`. `salt` is freshly generated by
    /// the caller and is written ahead of the first frame.
    pub fn new(kind: CipherKind, master_key: &[u8], salt: &[u8]) -> Self {
        let subkey = crate::crypto::derive_subkey(master_key, salt, kind.key_len());

        let mut buffer = BytesMut::with_capacity(salt.len());
        buffer.put(salt);

        Self {
            cipher: Cipher::new(kind, &subkey),
            buffer,
            state: EncryptWriteState::AssemblePacket,
            salt: Bytes::copy_from_slice(salt),
        }
    }

    pub fn salt(&self) -> &[u8] {
        self.salt.as_ref()
    }

    pub fn poll_write_encrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &[u8],
    ) -> Poll<io::Result<usize>>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        let buf = if buf.len() > MAX_PACKET_SIZE {
            &buf[..MAX_PACKET_SIZE]
        } else {
            buf
        };

        loop {
            match self.state {
                EncryptWriteState::AssemblePacket => {
                    let tag_len = self.cipher.tag_len();

                    let length_size = 2 + tag_len;
                    self.buffer.reserve(length_size);
                    let start = self.buffer.len();
                    self.buffer.put_u16(buf.len() as u16);
                    self.buffer.resize(start + length_size, 0);
                    self.cipher
                        .encrypt(&mut self.buffer[start..start + length_size]);

                    let data_size = buf.len() + tag_len;
                    self.buffer.reserve(data_size);
                    let start = self.buffer.len();
                    self.buffer.put_slice(buf);
                    self.buffer.resize(start + data_size, 0);
                    self.cipher
                        .encrypt(&mut self.buffer[start..start + data_size]);

                    self.state = EncryptWriteState::Writing { pos: 0 };
                }

                EncryptWriteState::Writing { ref mut pos } => {
                    while *pos < self.buffer.len() {
                        let n = ready!(Pin::new(&mut *stream).poll_write(cx, &self.buffer[*pos..]))?;
                        if n == 0 {
                            return Err(ErrorKind::WriteZero.into()).into();
                        }
                        *pos += n;
                    }

                    self.state = EncryptWriteState::AssemblePacket;
                    self.buffer.clear();

                    return Ok(buf.len()).into();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_master_key;
    use std::future::poll_fn;

    async fn write_all(
        writer: &mut EncryptedWriter,
        stream: &mut (impl AsyncWrite + Unpin),
        buf: &[u8],
    ) {
        let mut written = 0;
        while written < buf.len() {
            let n = poll_fn(|cx| writer.poll_write_encrypted(cx, stream, &buf[written..]))
                .await
                .unwrap();
            written += n;
        }
    }

    async fn read_exact_decrypted(
        reader: &mut DecryptedReader,
        stream: &mut (impl AsyncRead + Unpin),
        out: &mut [u8],
    ) {
        let mut read = 0;
        while read < out.len() {
            let mut read_buf = ReadBuf::new(&mut out[read..]);
            poll_fn(|cx| reader.poll_read_decrypted(cx, stream, &mut read_buf))
                .await
                .unwrap();
            let n = read_buf.filled().len();
            assert!(n > 0, "stream ended early");
            read += n;
        }
    }

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let kind = CipherKind::Aes128Gcm;
        let master_key = derive_master_key(b"secret", kind.key_len());
        let salt = vec![9u8; kind.salt_len()];

        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut writer = EncryptedWriter::new(kind, &master_key, &salt);
        write_all(&mut writer, &mut client, b"hello world").await;

        let mut reader = DecryptedReader::new(kind, &master_key);
        let mut out = vec![0u8; b"hello world".len()];
        read_exact_decrypted(&mut reader, &mut server, &mut out).await;

        assert_eq!(&out, b"hello world");
    }

    #[tokio::test]
    async fn authenticate_does_not_consume_plaintext() {
        let kind = CipherKind::ChaCha20Poly1305;
        let master_key = derive_master_key(b"secret", kind.key_len());
        let salt = vec![3u8; kind.salt_len()];

        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut writer = EncryptedWriter::new(kind, &master_key, &salt);
        write_all(&mut writer, &mut client, b"x").await;

        let mut reader = DecryptedReader::new(kind, &master_key);
        poll_fn(|cx| reader.poll_authenticate(cx, &mut server))
            .await
            .unwrap();

        let mut out = [0u8; 1];
        read_exact_decrypted(&mut reader, &mut server, &mut out).await;
        assert_eq!(&out, b"x");
    }

    #[tokio::test]
    async fn authenticate_fails_on_wrong_key() {
        let kind = CipherKind::Aes128Gcm;
        let master_key = derive_master_key(b"right-secret", kind.key_len());
        let wrong_key = derive_master_key(b"wrong-secret", kind.key_len());
        let salt = vec![5u8; kind.salt_len()];

        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut writer = EncryptedWriter::new(kind, &master_key, &salt);
        write_all(&mut writer, &mut client, b"x").await;

        let mut reader = DecryptedReader::new(kind, &wrong_key);
        let err = poll_fn(|cx| reader.poll_authenticate(cx, &mut server))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DecryptLengthError));
    }
}
