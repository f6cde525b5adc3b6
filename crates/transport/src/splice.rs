//! Bidirectional byte pump shared by every hop that just forwards a
//! tunnel instead of interpreting it: the SOCKS5 pivot, a terminal
//! agent's outbound socket, and every intermediate agent relaying a
//! CONNECT once its handshake completes.

use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};

/// Runs until either side hits EOF or an error, then drops both ends.
/// The first direction to finish wins; the other is abandoned.
pub async fn splice<A, B>(mut a: A, mut b: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    copy_bidirectional(&mut a, &mut b).await
}
