//! Just enough SOCKS5 to pivot a CONNECT request into a tunnel:
//! NO-AUTH only, CONNECT only, IPv4/domain/IPv6 address types.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    UnsupportedVersion,
    NoMethodsOffered,
    UnsupportedCommand,
    UnsupportedAddressType,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::UnsupportedVersion => write!(f, "client did not speak SOCKS5"),
            Self::NoMethodsOffered => write!(f, "greeting offered zero authentication methods"),
            Self::UnsupportedCommand => write!(f, "only CONNECT is supported"),
            Self::UnsupportedAddressType => write!(f, "unrecognized address type"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// One of the three address shapes a SOCKS5 CONNECT request may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4([u8; 4]),
    Domain(String),
    Ipv6([u8; 16]),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4(octets) => write!(f, "{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]),
            Self::Domain(name) => write!(f, "{name}"),
            Self::Ipv6(segments) => write!(f, "{}", std::net::Ipv6Addr::from(*segments)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: Address,
    pub port: u16,
}

/// SOCKS5 reply codes, per RFC 1928 §6.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Reads the version-identifier/method-selection greeting and replies
/// selecting NO-AUTH. Does not inspect the offered method list beyond
/// requiring at least one byte, matching how lenient deployments of
/// this handshake already behave in the wild.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(), Error> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Error::UnsupportedVersion);
    }

    let n_methods = header[1] as usize;
    if n_methods == 0 {
        return Err(Error::NoMethodsOffered);
    }

    let mut methods = vec![0u8; n_methods];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[VERSION, 0x00]).await?;
    Ok(())
}

/// Reads a CONNECT request following a successful [`handshake`].
pub async fn read_connect_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<ConnectRequest, Error> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        return Err(Error::UnsupportedVersion);
    }
    if header[1] != CMD_CONNECT {
        return Err(Error::UnsupportedCommand);
    }

    let address = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Address::Ipv4(octets)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            Address::Domain(String::from_utf8_lossy(&name).into_owned())
        }
        ATYP_IPV6 => {
            let mut segments = [0u8; 16];
            stream.read_exact(&mut segments).await?;
            Address::Ipv6(segments)
        }
        _ => return Err(Error::UnsupportedAddressType),
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(ConnectRequest { address, port })
}

/// Writes the fixed 10-byte reply. The bound-address field is always
/// zeroed; this pivot never reports the real bind address.
pub async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, code: Reply) -> Result<(), Error> {
    let reply = [VERSION, code as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    Ok(())
}
