//! Translates one accepted SOCKS5 client connection into a tunneled
//! stream through the agent path leading to `target`, then hands the
//! rest of the connection's life to a bidirectional splice.

use anyhow::{Context, Result, bail};
use proto::{ConnectPayload, DataPayload, Envelope, MessageType, read_envelope, write_envelope};
use socks5::Reply;
use tokio::net::TcpStream;
use transport::{compat, splice};

use crate::admin::{Admin, ROOT_PARENT};

const CONNECTED_PAYLOAD: &[u8] = b"Connected";

pub async fn handle_connection(admin: &Admin, mut client: TcpStream, target: &str) -> Result<()> {
    socks5::handshake(&mut client).await.context("socks5 handshake")?;
    let request = match socks5::read_connect_request(&mut client).await {
        Ok(request) => request,
        Err(_) => {
            let _ = socks5::write_reply(&mut client, Reply::GeneralFailure).await;
            bail!("malformed CONNECT request");
        }
    };

    let path = admin.topology.get_path(target)?;
    let Some(first_hop) = path.first().cloned() else {
        socks5::write_reply(&mut client, Reply::HostUnreachable).await?;
        bail!("no path to {target}");
    };

    let Some(handle) = admin.agent_handle(&first_hop) else {
        socks5::write_reply(&mut client, Reply::HostUnreachable).await?;
        bail!("agent {first_hop} is not connected");
    };

    let stream = match handle.open_stream().await {
        Ok(stream) => stream,
        Err(err) => {
            socks5::write_reply(&mut client, Reply::GeneralFailure).await?;
            bail!("opening stream to {first_hop}: {err}");
        }
    };
    let mut io = compat(stream);

    let connect_payload = ConnectPayload {
        target_agent_id: target.to_string(),
        target_address: request.address.to_string(),
        target_port: request.port as u32,
    };
    let inner = Envelope::new(MessageType::Connect, ROOT_PARENT, target).with_payload(&connect_payload);
    let outgoing = if path.len() == 1 {
        inner
    } else {
        Envelope::new(MessageType::Relay, ROOT_PARENT, target).with_payload(&inner)
    };
    write_envelope(&mut io, &outgoing).await?;

    let ack = read_envelope(&mut io).await;
    let connected = match ack {
        Ok(envelope) if envelope.kind() == Some(MessageType::Data) => {
            envelope.decode_payload::<DataPayload>().map(|payload| payload.data == CONNECTED_PAYLOAD).unwrap_or(false)
        }
        _ => false,
    };

    if !connected {
        socks5::write_reply(&mut client, Reply::ConnectionRefused).await?;
        bail!("agent path to {target} refused the connection");
    }

    socks5::write_reply(&mut client, Reply::Success).await?;
    splice(client, io).await?;
    Ok(())
}
