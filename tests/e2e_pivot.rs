mod common;

use std::time::Duration;

use anyhow::Result;
use bproxy::config::Liveness;
use common::{spawn_admin, spawn_agent, wait_until};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn default_liveness() -> Liveness {
    Liveness { sweep_interval_secs: 30, timeout_secs: 60 }
}

/// An in-test TCP server that echoes back whatever it reads once,
/// standing in for the "target" an operator pivots a SOCKS5 client
/// through an agent towards.
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 256];
            if let Ok(n) = socket.read(&mut buf).await {
                let _ = socket.write_all(&buf[..n]).await;
            }
        }
    });
    port
}

async fn socks5_connect(pivot_port: u16, target_port: u16) -> Result<(TcpStream, u8)> {
    let mut client = TcpStream::connect(("127.0.0.1", pivot_port)).await?;

    client.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await?;
    assert_eq!(greeting_reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&target_port.to_be_bytes());
    client.write_all(&request).await?;

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await?;
    Ok((client, reply[1]))
}

#[tokio::test]
async fn e1_direct_socks5_pivot_relays_bytes() {
    let (admin, admin_addr) = spawn_admin(default_liveness()).await;
    let agent = spawn_agent(admin_addr, None);

    let registered = wait_until(|| admin.topology.get_all_nodes().iter().any(|n| n.id == agent.id && n.active), Duration::from_secs(5)).await;
    assert!(registered, "agent never registered with admin");

    let echo_port = spawn_echo_server().await;
    admin.start_socks5(0, agent.id.clone()).await.unwrap();
    let (pivot_port, _) = admin.socks5_servers().into_iter().find(|(_, target)| target == &agent.id).unwrap();

    let (mut tunnel, reply_code) = socks5_connect(pivot_port, echo_port).await.unwrap();
    assert_eq!(reply_code, 0x00, "expected SOCKS5 success reply");

    tunnel.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");
}

#[tokio::test]
async fn e2_cascaded_socks5_pivot_relays_bytes() {
    let (admin, admin_addr) = spawn_admin(default_liveness()).await;

    let cascade_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let agent1 = spawn_agent(admin_addr, Some(cascade_port));
    let registered1 = wait_until(|| admin.topology.get_all_nodes().iter().any(|n| n.id == agent1.id && n.active), Duration::from_secs(5)).await;
    assert!(registered1, "agent1 never registered with admin");

    let agent2 = spawn_agent(format!("127.0.0.1:{cascade_port}").parse().unwrap(), None);
    let registered2 = wait_until(|| admin.topology.get_all_nodes().iter().any(|n| n.id == agent2.id && n.active), Duration::from_secs(5)).await;
    assert!(registered2, "agent2 never cascaded through agent1");

    let path = admin.topology.get_path(&agent2.id).unwrap();
    assert_eq!(path, vec![agent1.id.clone(), agent2.id.clone()]);

    let echo_port = spawn_echo_server().await;
    admin.start_socks5(0, agent2.id.clone()).await.unwrap();
    let (pivot_port, _) = admin.socks5_servers().into_iter().find(|(_, target)| target == &agent2.id).unwrap();

    let (mut tunnel, reply_code) = socks5_connect(pivot_port, echo_port).await.unwrap();
    assert_eq!(reply_code, 0x00);

    tunnel.write_all(b"cascade").await.unwrap();
    let mut echoed = [0u8; 7];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"cascade");
}

#[tokio::test]
async fn e3_unknown_target_yields_host_unreachable() {
    let (admin, _admin_addr) = spawn_admin(default_liveness()).await;

    admin.start_socks5(0, "nonexistent".to_string()).await.unwrap();
    let (pivot_port, _) = admin.socks5_servers().into_iter().find(|(_, target)| target == "nonexistent").unwrap();

    let (_client, reply_code) = socks5_connect(pivot_port, 1).await.unwrap();
    assert_eq!(reply_code, 0x04, "expected host-unreachable for an unknown target");
}

#[tokio::test]
async fn e4_unreachable_target_yields_connection_refused() {
    let (admin, admin_addr) = spawn_admin(default_liveness()).await;
    let agent = spawn_agent(admin_addr, None);
    let registered = wait_until(|| admin.topology.get_all_nodes().iter().any(|n| n.id == agent.id && n.active), Duration::from_secs(5)).await;
    assert!(registered);

    admin.start_socks5(0, agent.id.clone()).await.unwrap();
    let (pivot_port, _) = admin.socks5_servers().into_iter().find(|(_, target)| target == &agent.id).unwrap();

    // Port 1 is reserved and nothing is listening on it in any test
    // sandbox, so the agent's dial is refused immediately.
    let (_client, reply_code) = socks5_connect(pivot_port, 1).await.unwrap();
    assert_eq!(reply_code, 0x05, "expected connection-refused for an unreachable target");
}
