mod common;

use std::time::Duration;

use bproxy::admin::Admin;
use bproxy::config::{Config as AdminConfig, Liveness};
use common::{spawn_agent, wait_until};
use proto::{Envelope, MessageType, RegisterPayload, read_envelope, write_envelope};
use tokio::net::TcpListener;
use transport::{Session, compat, tls};

/// Accepts exactly one registration on `listener`, mirroring what
/// `Admin::handle_connection` does for the first stream, then drops
/// the whole session — closing the connection out from under the
/// agent the way a killed administrator process would.
async fn accept_one_registration_then_vanish(listener: TcpListener, topology: &topology::Topology) {
    let (stream, _peer) = listener.accept().await.unwrap();
    let (certs, key) = tls::load_or_self_signed("", "").unwrap();
    let acceptor = tls::server_acceptor(certs, key).unwrap();
    let tls_stream = tls::accept(&acceptor, stream).await.unwrap();
    let (handle, mut incoming) = Session::server(tls_stream).split();

    let first = incoming.accept().await.unwrap();
    let mut io = compat(first);
    let envelope = read_envelope(&mut io).await.unwrap();
    assert_eq!(envelope.kind(), Some(MessageType::Register));
    let payload: RegisterPayload = envelope.decode_payload().unwrap();
    topology.add_node(&payload.agent_id, &payload.hostname, payload.local_ips.clone(), &payload.os, &payload.arch);

    let mut ack = Envelope::new(MessageType::Command, "admin", &payload.agent_id);
    ack.payload = b"OK".to_vec();
    write_envelope(&mut io, &ack).await.unwrap();
    drop(io);

    // Dropping the session's handle/incoming halves tears down the
    // background connection driver, which closes the socket.
    drop(handle);
    drop(incoming);
}

#[tokio::test]
async fn e6_agent_reconnects_after_admin_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = listener.local_addr().unwrap();
    let topology = topology::Topology::new();

    let agent = spawn_agent(admin_addr, None);
    accept_one_registration_then_vanish(listener, &topology).await;

    assert!(topology.get_all_nodes().iter().any(|n| n.id == agent.id));

    // Give the agent's session loop a moment to notice the closed
    // connection before the restarted administrator comes up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second_config = AdminConfig { listen: admin_addr, ssl: None, liveness: Liveness { sweep_interval_secs: 30, timeout_secs: 60 }, log: Default::default() };
    let second_admin = Admin::new(second_config);
    let (listener, acceptor) = second_admin.bind().await.expect("rebinding the admin address");
    tokio::spawn(second_admin.clone().serve(listener, acceptor));

    let reregistered = wait_until(
        || second_admin.topology.get_all_nodes().iter().any(|n| n.id == agent.id && n.active),
        Duration::from_secs(15),
    )
    .await;
    assert!(reregistered, "agent never reconnected to the restarted admin process");
}
