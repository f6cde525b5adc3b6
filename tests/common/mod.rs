use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bproxy::admin::Admin;
use bproxy::config::Config as AdminConfig;
use bproxy_agent::Agent;
use bproxy_agent::config::Config as AgentConfig;

/// Starts an administrator on an ephemeral loopback port and returns
/// it alongside the port actually bound, so callers can point agents
/// and pivots at it without a fixed port colliding across test runs.
pub async fn spawn_admin(liveness: bproxy::config::Liveness) -> (Arc<Admin>, SocketAddr) {
    let config = AdminConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ssl: None,
        liveness,
        log: Default::default(),
    };
    let admin = Admin::new(config);
    let (listener, acceptor) = admin.bind().await.expect("bind admin listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(admin.clone().serve(listener, acceptor));
    (admin, addr)
}

/// Dials `admin_addr` and drives the resulting session forever on a
/// background task, mirroring how the `agent` binary runs. Returns
/// the generated agent id once registration would have had time to
/// complete.
pub fn spawn_agent(admin_addr: SocketAddr, cascade: Option<u16>) -> Arc<Agent> {
    let config = AgentConfig {
        admin: admin_addr,
        cascade,
        liveness: bproxy_agent::config::Liveness {
            heartbeat_interval_secs: 1,
            reconnect_delay_secs: 1,
            dial_timeout_secs: 2,
        },
        log: Default::default(),
    };
    let agent = Agent::new(config);
    tokio::spawn(agent.clone().run());
    agent
}

/// Polls `condition` until it returns `true` or `timeout` elapses,
/// used in place of fixed sleeps around asynchronous registration.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
