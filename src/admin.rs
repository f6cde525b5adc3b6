//! The administrator: accepts agents, tracks topology, dispatches
//! commands, and hosts the SOCKS5 pivots operators tunnel through.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::{HashMap, HashMapExt};
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use proto::{
    CommandPayload, DataPayload, Envelope, HeartbeatPayload, MessageType, RegisterPayload,
    read_envelope, write_envelope,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, interval};
use topology::Topology;
use transport::{Session, SessionHandle, compat, tls};

use crate::config::Config;

const OK_PAYLOAD: &[u8] = b"OK";

pub const ROOT_PARENT: &str = "admin";

struct AgentConnection {
    handle: SessionHandle,
}

struct Pivot {
    target: String,
    shutdown: tokio::sync::oneshot::Sender<()>,
}

pub struct Admin {
    pub topology: Arc<Topology>,
    agents: RwLock<HashMap<String, Arc<AgentConnection>>>,
    pivots: Mutex<HashMap<u16, Pivot>>,
    config: Config,
}

impl Admin {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            topology: Arc::new(Topology::new()),
            agents: RwLock::new(HashMap::with_capacity(64)),
            pivots: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (listener, acceptor) = self.bind().await?;
        self.serve(listener, acceptor).await
    }

    /// Binds the listening socket and builds the TLS acceptor without
    /// starting the accept loop, so a caller can learn the bound port
    /// (useful when `config.listen` asks for an ephemeral one) before
    /// handing both off to [`Admin::serve`].
    pub async fn bind(&self) -> Result<(TcpListener, tokio_rustls::TlsAcceptor)> {
        let acceptor = match &self.config.ssl {
            Some(ssl) => {
                let (certs, key) = tls::load_or_self_signed(&ssl.certificate_chain, &ssl.private_key)?;
                tls::server_acceptor(certs, key)?
            }
            None => {
                let (certs, key) = tls::load_or_self_signed("", "")?;
                tls::server_acceptor(certs, key)?
            }
        };

        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("binding {}", self.config.listen))?;
        info!("admin: listening on {}", listener.local_addr()?);

        Ok((listener, acceptor))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor) -> Result<()> {
        tokio::spawn(self.clone().liveness_sweeper());

        loop {
            let (stream, peer) = listener.accept().await?;
            let admin = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(err) = admin.handle_connection(stream, acceptor, peer).await {
                    warn!("admin: connection from {peer} ended: {err}");
                }
            });
        }
    }

    async fn liveness_sweeper(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.liveness.sweep_interval_secs));
        loop {
            ticker.tick().await;
            let dead = self.topology.check_dead(self.config.liveness.timeout_secs);
            if dead.is_empty() {
                continue;
            }
            let mut agents = self.agents.write();
            for id in dead {
                if agents.remove(&id).is_some() {
                    info!("admin: agent {id} timed out, dropping connection");
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        acceptor: tokio_rustls::TlsAcceptor,
        peer: SocketAddr,
    ) -> Result<()> {
        let tls_stream = tls::accept(&acceptor, stream).await?;
        let (handle, mut incoming) = Session::server(tls_stream).split();

        let first = incoming.accept().await.context("agent closed before registering")?;
        let mut io = compat(first);
        let envelope = read_envelope(&mut io).await?;
        if envelope.kind() != Some(MessageType::Register) {
            bail!("expected REGISTER from {peer}, got {:?}", envelope.kind());
        }

        let payload: RegisterPayload = envelope.decode_payload()?;
        let agent_id = payload.agent_id.clone();
        self.register(&payload, None)?;

        let mut ack = Envelope::new(MessageType::Command, ROOT_PARENT, &agent_id);
        ack.payload = OK_PAYLOAD.to_vec();
        write_envelope(&mut io, &ack).await?;
        drop(io);

        self.agents.write().insert(agent_id.clone(), Arc::new(AgentConnection { handle }));
        info!("admin: agent {agent_id} registered from {peer}");

        loop {
            let stream = match incoming.accept().await {
                Some(stream) => stream,
                None => break,
            };
            let admin = self.clone();
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                if let Err(err) = admin.handle_stream(&agent_id, stream).await {
                    debug!("admin: stream from {agent_id} ended: {err}");
                }
            });
        }

        self.agents.write().remove(&agent_id);
        self.topology.remove_node(&agent_id);
        info!("admin: agent {agent_id} disconnected");
        Ok(())
    }

    /// Registers `payload.agent_id`. `parent` is the id of the agent
    /// whose own connection this REGISTER physically arrived over —
    /// `None` for a direct registration, `Some(relaying_agent)` for
    /// one forwarded up from a cascade. That connection provenance,
    /// not anything the payload claims about itself, is what the
    /// topology edge is built from.
    fn register(&self, payload: &RegisterPayload, parent: Option<&str>) -> Result<()> {
        self.topology
            .add_node(&payload.agent_id, &payload.hostname, payload.local_ips.clone(), &payload.os, &payload.arch);

        if let Some(parent) = parent {
            if parent != payload.agent_id {
                self.topology.add_edge(parent, &payload.agent_id)?;
            }
        }

        Ok(())
    }

    async fn handle_stream(self: Arc<Self>, agent_id: &str, stream: transport::MuxStream) -> Result<()> {
        let mut io = compat(stream);
        let envelope = read_envelope(&mut io).await?;

        match envelope.kind() {
            Some(MessageType::Heartbeat) => {
                let source = if envelope.source_id.is_empty() { agent_id.to_string() } else { envelope.source_id.clone() };
                self.topology.update_heartbeat(&source);
                let ack = Envelope::new(MessageType::Heartbeat, ROOT_PARENT, &source).with_payload(&HeartbeatPayload {
                    agent_id: source.clone(),
                    timestamp: unix_now(),
                });
                write_envelope(&mut io, &ack).await?;
            }
            Some(MessageType::Register) => {
                let payload: RegisterPayload = envelope.decode_payload()?;
                self.register(&payload, Some(agent_id))?;
                let mut ack = Envelope::new(MessageType::Command, ROOT_PARENT, &payload.agent_id);
                ack.payload = OK_PAYLOAD.to_vec();
                write_envelope(&mut io, &ack).await?;
            }
            Some(MessageType::Data) => {
                let payload: DataPayload = envelope.decode_payload()?;
                debug!("admin: {} bytes of DATA from {agent_id}", payload.data.len());
            }
            Some(MessageType::Relay) => {
                self.relay(&envelope).await?;
            }
            other => warn!("admin: dropping unexpected envelope {other:?} from {agent_id}"),
        }

        Ok(())
    }

    /// One-hop best-effort forward: looks up the target's direct
    /// connection and hands it the envelope. Indirect targets are
    /// reached because each hop along the way re-wraps and forwards
    /// in turn (see the agent-side cascade relay).
    async fn relay(&self, envelope: &Envelope) -> Result<()> {
        let target = envelope.target_id.clone();
        let connection = {
            let agents = self.agents.read();
            agents.get(&target).cloned()
        };

        let Some(connection) = connection else {
            bail!("relay target {target} is not connected");
        };

        let stream = connection.handle.open_stream().await?;
        let mut io = compat(stream);
        write_envelope(&mut io, envelope).await?;
        Ok(())
    }

    /// Sends a COMMAND to `target`, wrapping it in a RELAY envelope
    /// whenever it is not a direct child.
    pub async fn send_command(&self, target: &str, payload: CommandPayload) -> Result<()> {
        let path = self.topology.get_path(target)?;
        let Some(first_hop) = path.first().cloned() else {
            bail!("no known path to {target}");
        };

        let connection = {
            let agents = self.agents.read();
            agents.get(&first_hop).cloned()
        };
        let Some(connection) = connection else {
            bail!("agent {first_hop} is not connected");
        };

        let inner = Envelope::new(MessageType::Command, ROOT_PARENT, target).with_payload(&payload);
        let outgoing = if path.len() == 1 {
            inner
        } else {
            Envelope::new(MessageType::Relay, ROOT_PARENT, target).with_payload(&inner)
        };

        let stream = connection.handle.open_stream().await?;
        let mut io = compat(stream);
        write_envelope(&mut io, &outgoing).await
            .map_err(|err| anyhow::anyhow!("sending command to {target} via {first_hop}: {err}"))
    }

    pub fn agents_snapshot(&self) -> Vec<topology::Node> {
        self.topology.get_all_nodes()
    }

    pub async fn start_socks5(self: &Arc<Self>, port: u16, target: String) -> Result<()> {
        {
            let pivots = self.pivots.lock();
            if pivots.contains_key(&port) {
                bail!("port {port} already has a pivot");
            }
        }

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("binding pivot port {port}"))?;
        let bound_port = listener.local_addr()?.port();

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.pivots.lock().insert(bound_port, Pivot { target: target.clone(), shutdown: shutdown_tx });

        let admin = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((client, _)) = accepted else { break };
                        let admin = admin.clone();
                        let target = target.clone();
                        tokio::spawn(async move {
                            if let Err(err) = crate::pivot::handle_connection(&admin, client, &target).await {
                                debug!("pivot: session for {target} ended: {err}");
                            }
                        });
                    }
                }
            }
        });

        Ok(())
    }

    pub fn stop_socks5(&self, port: u16) -> Result<()> {
        let pivot = self.pivots.lock().remove(&port);
        match pivot {
            Some(pivot) => {
                let _ = pivot.shutdown.send(());
                Ok(())
            }
            None => bail!("no pivot listening on port {port}"),
        }
    }

    pub fn socks5_servers(&self) -> Vec<(u16, String)> {
        self.pivots.lock().iter().map(|(port, pivot)| (*port, pivot.target.clone())).collect()
    }

    pub(crate) fn agent_handle(&self, id: &str) -> Option<SessionHandle> {
        self.agents.read().get(id).map(|conn| conn.handle.clone())
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
