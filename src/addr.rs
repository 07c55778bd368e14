//! SOCKS5-style destination address: the first plaintext payload a
//! client sends after the cipher handshake.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(thiserror::Error, Debug)]
pub enum AddrError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("unknown address type {0:#x}")]
    UnknownType(u8),
    #[error("domain name length must not be zero")]
    EmptyDomain,
}

/// A parsed destination address, as carried by the first plaintext
/// payload of a shadowsocks connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4(SocketAddrV4),
    IPv6(SocketAddrV6),
    Domain(String, u16),
}

impl Address {
    /// Read one address from `reader`: a 1-byte ATYP, the address
    /// body, and a 2-byte big-endian port.
    pub async fn read<R>(reader: &mut R) -> Result<Address, AddrError>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(Address::IPv4(SocketAddrV4::new(
                    Ipv4Addr::from(octets),
                    port,
                )))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(Address::IPv6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                )))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await?;
                if len == 0 {
                    return Err(AddrError::EmptyDomain);
                }
                let mut buf = vec![0u8; len as usize];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8_lossy(&buf).into_owned();
                let port = reader.read_u16().await?;
                Ok(Address::Domain(domain, port))
            }
            other => Err(AddrError::UnknownType(other)),
        }
    }

    /// Encode this address back into SOCKS wire form. Only used by
    /// tests; the production path never re-encodes a destination.
    #[cfg(test)]
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Address::IPv4(addr) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::IPv6(addr) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(addr) => write!(f, "{addr}"),
            Address::IPv6(addr) => write!(f, "{addr}"),
            Address::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_ipv4() {
        let addr = Address::IPv4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080));
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);

        let mut cursor = Cursor::new(buf.to_vec());
        let parsed = Address::read(&mut cursor).await.unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn round_trips_ipv6() {
        let addr = Address::IPv6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 0, 0));
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);

        let mut cursor = Cursor::new(buf.to_vec());
        let parsed = Address::read(&mut cursor).await.unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn round_trips_domain() {
        let addr = Address::Domain("example.com".to_owned(), 443);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);

        let mut cursor = Cursor::new(buf.to_vec());
        let parsed = Address::read(&mut cursor).await.unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn rejects_unknown_type() {
        let mut cursor = Cursor::new(vec![0x02u8, 0, 0, 0]);
        let err = Address::read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, AddrError::UnknownType(0x02)));
    }

    #[tokio::test]
    async fn rejects_empty_domain() {
        let mut cursor = Cursor::new(vec![ATYP_DOMAIN, 0]);
        let err = Address::read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, AddrError::EmptyDomain));
    }
}
