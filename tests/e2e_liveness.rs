mod common;

use std::time::Duration;

use bproxy::config::Liveness;
use common::{spawn_admin, wait_until};
use proto::{Envelope, MessageType, RegisterPayload, read_envelope, write_envelope};
use transport::{Session, compat, tls};

/// Registers directly against an admin and then drops the session
/// without ever heartbeating, standing in for an agent process that
/// vanished (crashed, network partition) right after announcing
/// itself.
async fn register_and_vanish(admin_addr: std::net::SocketAddr, agent_id: &str) {
    let stream = tokio::net::TcpStream::connect(admin_addr).await.unwrap();
    let connector = tls::insecure_client_connector();
    let tls_stream = tls::connect(&connector, &admin_addr.to_string(), stream).await.unwrap();
    let (handle, _incoming) = Session::client(tls_stream).split();

    let register_stream = handle.open_stream().await.unwrap();
    let mut io = compat(register_stream);
    let payload = RegisterPayload {
        agent_id: agent_id.to_string(),
        hostname: "vanishing-host".to_string(),
        local_ips: vec!["10.0.0.9".to_string()],
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        parent_id: "admin".to_string(),
    };
    let envelope = Envelope::new(MessageType::Register, agent_id, "admin").with_payload(&payload);
    write_envelope(&mut io, &envelope).await.unwrap();

    let ack = read_envelope(&mut io).await.unwrap();
    assert_eq!(ack.kind(), Some(MessageType::Command));
    // `handle`/`io` drop here, closing the session without ever
    // sending a HEARTBEAT.
}

#[tokio::test]
async fn e5_liveness_marks_silent_agent_inactive() {
    let (admin, admin_addr) = spawn_admin(Liveness { sweep_interval_secs: 1, timeout_secs: 1 }).await;

    register_and_vanish(admin_addr, "ghost-agent").await;

    let registered = wait_until(|| admin.topology.get_all_nodes().iter().any(|n| n.id == "ghost-agent"), Duration::from_secs(2)).await;
    assert!(registered, "registration should be visible before the sweep runs");

    let flipped_dead = wait_until(
        || admin.topology.get_all_nodes().iter().any(|n| n.id == "ghost-agent" && !n.active),
        Duration::from_secs(5),
    )
    .await;
    assert!(flipped_dead, "liveness sweep never marked the silent agent inactive");
}
