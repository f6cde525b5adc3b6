//! Mutually-reachable byte transport for the admin/agent link: TLS
//! for confidentiality plus a multiplexer so one TCP connection can
//! carry many independent logical streams.

pub mod mux;
pub mod splice;
pub mod tls;

pub use mux::{IncomingStreams, MuxStream, Session, SessionHandle, compat};
pub use splice::splice;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    InvalidCertificate,
    Mux(yamux::ConnectionError),
    SessionClosed,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::InvalidCertificate => write!(f, "invalid certificate or key material"),
            Self::Mux(err) => write!(f, "multiplexer error: {err}"),
            Self::SessionClosed => write!(f, "multiplexed session is closed"),
        }
    }
}
