//! Stream multiplexing on top of one TLS connection.
//!
//! Yamux gives either peer the ability to open new logical streams
//! over a single underlying connection, each independently ordered
//! and flow-controlled. A background task drives the connection
//! (yamux's I/O happens inline with polling, so something must keep
//! calling into it even when nothing local wants a new stream); this
//! task also fans inbound streams out through a channel.
//!
//! A session splits into a cloneable [`SessionHandle`] for opening
//! outbound streams from any task, and a single-owner
//! [`IncomingStreams`] for the one task that accepts inbound streams.

use futures::future::poll_fn;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use yamux::{Config, Connection, ConnectionError, Mode};

use crate::Error;

pub type MuxStream = yamux::Stream;

/// Adapts a yamux stream (futures-io traits) to tokio's AsyncRead /
/// AsyncWrite, so the rest of the codebase only ever deals with one
/// I/O trait family.
pub fn compat(stream: MuxStream) -> Compat<MuxStream> {
    stream.compat()
}

type OpenReply = oneshot::Sender<Result<MuxStream, Error>>;

#[derive(Clone)]
pub struct SessionHandle {
    open_tx: mpsc::UnboundedSender<OpenReply>,
}

impl SessionHandle {
    /// Opens a new outbound logical stream.
    pub async fn open_stream(&self) -> Result<MuxStream, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx.send(reply_tx).map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)?
    }
}

pub struct IncomingStreams {
    inbound_rx: mpsc::Receiver<MuxStream>,
}

impl IncomingStreams {
    /// Accepts the next stream opened by the remote peer. Resolves
    /// to `None` once the underlying connection is gone.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.inbound_rx.recv().await
    }
}

pub struct Session {
    pub handle: SessionHandle,
    pub incoming: IncomingStreams,
}

impl Session {
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(io, Mode::Client)
    }

    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(io, Mode::Server)
    }

    fn spawn<T>(io: T, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::new(io.compat(), Config::default(), mode);
        let (open_tx, open_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        tokio::spawn(drive(connection, open_rx, inbound_tx));
        Self {
            handle: SessionHandle { open_tx },
            incoming: IncomingStreams { inbound_rx },
        }
    }

    /// Splits into an independently-clonable outbound handle and the
    /// single-consumer inbound stream queue.
    pub fn split(self) -> (SessionHandle, IncomingStreams) {
        (self.handle, self.incoming)
    }
}

async fn drive<T>(
    mut connection: Connection<Compat<T>>,
    mut open_rx: mpsc::UnboundedReceiver<OpenReply>,
    inbound_tx: mpsc::Sender<MuxStream>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;

            open = open_rx.recv() => {
                let Some(reply) = open else { break };
                let outcome = poll_fn(|cx| connection.poll_new_outbound(cx)).await;
                if let Err(err) = &outcome {
                    warn!("transport: opening outbound mux stream failed: {err}");
                }
                let _ = reply.send(outcome.map_err(Error::Mux));
            }

            inbound = poll_fn(|cx| connection.poll_next_inbound(cx)) => {
                match inbound {
                    Some(Ok(stream)) => {
                        if inbound_tx.send(stream).await.is_err() {
                            debug!("transport: dropping inbound mux stream, no receiver left");
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("transport: mux connection closed with error: {err}");
                        break;
                    }
                    None => {
                        debug!("transport: mux connection closed");
                        break;
                    }
                }
            }
        }
    }

    let _ = poll_fn(|cx| connection.poll_close(cx)).await;
}

impl From<ConnectionError> for Error {
    fn from(value: ConnectionError) -> Self {
        Error::Mux(value)
    }
}
