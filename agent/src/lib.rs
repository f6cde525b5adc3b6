//! Outbound-dialing node: connects to an administrator (or another
//! agent's cascade listener), registers, heartbeats, and serves
//! whatever streams its parent opens back at it.

pub mod config;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use parking_lot::RwLock;
use proto::{
    CommandPayload, ConnectPayload, DataPayload, Envelope, MessageType, RegisterPayload,
    read_envelope, write_envelope,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};
use transport::{Session, SessionHandle, compat, tls};

use crate::config::Config;

const OK_PAYLOAD: &[u8] = b"OK";
const CONNECTED_PAYLOAD: &[u8] = b"Connected";
const FAILED_PAYLOAD: &[u8] = b"Failed";
const COMMAND_EXECUTED_PAYLOAD: &[u8] = b"Command executed";

pub struct Agent {
    pub id: String,
    config: Config,
    /// Children accepted through this agent's cascade listener,
    /// keyed by their own agent id.
    relay_map: RwLock<HashMap<String, SessionHandle>>,
    /// The handle for our current session with whatever we dialed
    /// (admin, or a cascade parent's admin link) — `None` between
    /// reconnect attempts.
    parent: RwLock<Option<SessionHandle>>,
}

impl Agent {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            relay_map: RwLock::new(HashMap::new()),
            parent: RwLock::new(None),
        })
    }

    pub async fn run(self: Arc<Self>) -> ! {
        loop {
            if let Err(err) = self.clone().session_cycle().await {
                warn!("agent {}: session ended: {err}", self.id);
            }
            sleep(Duration::from_secs(self.config.liveness.reconnect_delay_secs)).await;
        }
    }

    async fn session_cycle(self: Arc<Self>) -> Result<()> {
        *self.parent.write() = None;
        let stream = TcpStream::connect(self.config.admin).await.context("dialing admin")?;
        let connector = tls::insecure_client_connector();
        let tls_stream = tls::connect(&connector, &self.config.admin.to_string(), stream).await?;
        let (handle, mut incoming) = Session::client(tls_stream).split();

        self.register(&handle).await?;
        info!("agent {}: registered with {}", self.id, self.config.admin);
        *self.parent.write() = Some(handle.clone());

        if let Some(port) = self.config.cascade {
            tokio::spawn(self.clone().cascade_listener(port));
        }

        let (term_tx, mut term_rx) = mpsc::channel::<anyhow::Error>(1);
        tokio::spawn(self.clone().heartbeat_loop(handle.clone(), term_tx));

        loop {
            tokio::select! {
                stream = incoming.accept() => {
                    let Some(stream) = stream else { break };
                    let agent = self.clone();
                    tokio::spawn(async move {
                        let mut io = compat(stream);
                        let envelope = match read_envelope(&mut io).await {
                            Ok(envelope) => envelope,
                            Err(err) => { debug!("agent: malformed inbound envelope: {err}"); return; }
                        };
                        if let Err(err) = agent.dispatch(envelope, io).await {
                            debug!("agent: stream handling ended: {err}");
                        }
                    });
                }
                Some(err) = term_rx.recv() => {
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    async fn register(&self, handle: &SessionHandle) -> Result<()> {
        let stream = handle.open_stream().await?;
        let mut io = compat(stream);

        let payload = RegisterPayload {
            agent_id: self.id.clone(),
            hostname: hostname(),
            local_ips: local_ips(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            parent_id: "admin".to_string(),
        };
        let envelope = Envelope::new(MessageType::Register, &self.id, "admin").with_payload(&payload);
        write_envelope(&mut io, &envelope).await?;

        let ack = read_envelope(&mut io).await?;
        if ack.kind() != Some(MessageType::Command) || ack.payload != OK_PAYLOAD {
            bail!("registration was not acknowledged");
        }
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>, handle: SessionHandle, term: mpsc::Sender<anyhow::Error>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.liveness.heartbeat_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(err) = self.send_heartbeat(&handle).await {
                let _ = term.send(err).await;
                return;
            }
        }
    }

    async fn send_heartbeat(&self, handle: &SessionHandle) -> Result<()> {
        let stream = handle.open_stream().await?;
        let mut io = compat(stream);
        let envelope = Envelope::new(MessageType::Heartbeat, &self.id, "admin").with_payload(&proto::HeartbeatPayload {
            agent_id: self.id.clone(),
            timestamp: unix_now(),
        });
        write_envelope(&mut io, &envelope).await?;
        let _ack = read_envelope(&mut io).await?;
        Ok(())
    }

    /// Listens for cascaded children. Each accepted connection is TLS
    /// and multiplexed exactly like the link to our own parent; we
    /// are the server side here instead of the client side.
    async fn cascade_listener(self: Arc<Self>, port: u16) -> Result<()> {
        let (certs, key) = tls::load_or_self_signed("", "")?;
        let acceptor = tls::server_acceptor(certs, key)?;
        let listener = TcpListener::bind(("0.0.0.0", port)).await.with_context(|| format!("binding cascade port {port}"))?;
        info!("agent {}: cascade listener on {port}", self.id);

        loop {
            let (stream, peer) = listener.accept().await?;
            let agent = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(err) = agent.handle_cascade_connection(stream, acceptor).await {
                    warn!("agent: cascade connection from {peer} ended: {err}");
                }
            });
        }
    }

    async fn handle_cascade_connection(self: Arc<Self>, stream: TcpStream, acceptor: tokio_rustls::TlsAcceptor) -> Result<()> {
        let tls_stream = tls::accept(&acceptor, stream).await?;
        let (handle, mut incoming) = Session::server(tls_stream).split();

        let first = incoming.accept().await.context("child closed before registering")?;
        let mut io = compat(first);
        let envelope = read_envelope(&mut io).await?;
        if envelope.kind() != Some(MessageType::Register) {
            bail!("expected REGISTER from cascade child, got {:?}", envelope.kind());
        }
        let payload: RegisterPayload = envelope.decode_payload()?;
        let child_id = payload.agent_id.clone();

        let forwarded = Envelope::new(MessageType::Register, &child_id, "admin").with_payload(&payload);
        let ack = self.forward_to_parent(&forwarded).await?;
        write_envelope(&mut io, &ack).await?;
        drop(io);

        self.relay_map.write().insert(child_id.clone(), handle);
        info!("agent {}: cascade child {child_id} registered", self.id);

        while let Some(stream) = incoming.accept().await {
            let agent = self.clone();
            let child_id = child_id.clone();
            tokio::spawn(async move {
                if let Err(err) = agent.relay_child_message(stream, &child_id).await {
                    debug!("agent: relaying message from {child_id} failed: {err}");
                }
            });
        }

        self.relay_map.write().remove(&child_id);
        info!("agent {}: cascade child {child_id} disconnected", self.id);
        Ok(())
    }

    /// Only meaningful while a `session_cycle` is alive; cascade
    /// children are only accepted after we've registered, so this is
    /// always `Some` by the time it's needed.
    fn parent_handle(&self) -> Option<SessionHandle> {
        self.parent.read().clone()
    }

    /// Opens a fresh stream on our own parent, writes `envelope`, and
    /// returns whatever it sends back.
    async fn forward_to_parent(&self, envelope: &Envelope) -> Result<Envelope> {
        let parent_handle = self.parent_handle().context("no parent session to relay through")?;
        let parent_stream = parent_handle.open_stream().await?;
        let mut parent_io = compat(parent_stream);
        write_envelope(&mut parent_io, envelope).await?;
        let ack = read_envelope(&mut parent_io).await?;
        Ok(ack)
    }

    /// Handles one stream opened by a cascade child after it has
    /// registered. Children only ever originate control-plane traffic
    /// addressed upward (heartbeats, nested registrations, command
    /// acknowledgements) — every one of them gets forwarded to our own
    /// parent one-shot and the parent's ack relayed straight back,
    /// never `dispatch()`, which handles streams *our* parent opens
    /// on us.
    async fn relay_child_message(self: Arc<Self>, stream: transport::MuxStream, child_id: &str) -> Result<()> {
        let mut io = compat(stream);
        let mut envelope = read_envelope(&mut io).await?;
        if envelope.source_id.is_empty() {
            envelope.source_id = child_id.to_string();
        }

        let ack = self.forward_to_parent(&envelope).await?;
        write_envelope(&mut io, &ack).await?;
        Ok(())
    }

    /// Dispatches one stream opened by *our own parent* on us.
    fn dispatch<S>(self: Arc<Self>, envelope: Envelope, io: S) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Box::pin(async move {
            match envelope.kind() {
                Some(MessageType::Command) => self.handle_command(envelope, io).await,
                Some(MessageType::Connect) => self.handle_connect(envelope, io).await,
                Some(MessageType::Relay) => self.handle_relay(envelope, io).await,
                Some(MessageType::Heartbeat) | Some(MessageType::Data) => {
                    debug!("agent: dropping {:?} received on an inbound stream", envelope.kind());
                    Ok(())
                }
                other => {
                    warn!("agent: dropping unrecognized envelope type {other:?}");
                    Ok(())
                }
            }
        })
    }

    async fn handle_command<S>(&self, envelope: Envelope, mut io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let _payload: CommandPayload = envelope.decode_payload()?;
        let ack = Envelope::new(MessageType::Data, &self.id, &envelope.source_id).with_payload(&DataPayload {
            data: COMMAND_EXECUTED_PAYLOAD.to_vec(),
            sequence: 0,
        });
        write_envelope(&mut io, &ack).await?;
        Ok(())
    }

    async fn handle_connect<S>(&self, envelope: Envelope, mut io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let payload: ConnectPayload = envelope.decode_payload()?;
        let address = format!("{}:{}", payload.target_address, payload.target_port);

        let dial = timeout(Duration::from_secs(self.config.liveness.dial_timeout_secs), TcpStream::connect(&address)).await;
        let socket = match dial {
            Ok(Ok(socket)) => socket,
            _ => {
                let ack = Envelope::new(MessageType::Data, &self.id, &envelope.source_id)
                    .with_payload(&DataPayload { data: FAILED_PAYLOAD.to_vec(), sequence: 0 });
                write_envelope(&mut io, &ack).await?;
                return Ok(());
            }
        };

        let ack = Envelope::new(MessageType::Data, &self.id, &envelope.source_id)
            .with_payload(&DataPayload { data: CONNECTED_PAYLOAD.to_vec(), sequence: 0 });
        write_envelope(&mut io, &ack).await?;

        transport::splice(socket, io).await?;
        Ok(())
    }

    async fn handle_relay<S>(self: Arc<Self>, envelope: Envelope, mut io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if envelope.target_id.is_empty() || envelope.target_id == self.id {
            let inner: Envelope = envelope.decode_payload()?;
            return self.dispatch(inner, io).await;
        }

        let child_handle = {
            let relay_map = self.relay_map.read();
            relay_map.get(&envelope.target_id).cloned()
        };
        let Some(child_handle) = child_handle else {
            bail!("no cascade child named {}", envelope.target_id);
        };

        let child_stream = child_handle.open_stream().await?;
        let mut child_io = compat(child_stream);

        write_envelope(&mut child_io, &envelope).await?;
        let ack = read_envelope(&mut child_io).await?;
        write_envelope(&mut io, &ack).await?;

        let connected = ack.kind() == Some(MessageType::Data)
            && ack.decode_payload::<DataPayload>().map(|p| p.data == CONNECTED_PAYLOAD).unwrap_or(false);

        if connected {
            transport::splice(io, child_io).await?;
        }

        Ok(())
    }
}

fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn hostname() -> String {
    hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "unknown".to_string())
}

/// Local non-loopback IPv4 addresses, the same restriction the
/// original topology reporting used: Admin only needs to show
/// operators routable addresses, not 127.0.0.1.
fn local_ips() -> Vec<String> {
    let Ok(interfaces) = local_ip_address::list_afinet_netifas() else {
        return Vec::new();
    };

    interfaces
        .into_iter()
        .filter_map(|(_, addr)| match addr {
            IpAddr::V4(ipv4) if ipv4 != Ipv4Addr::LOCALHOST => Some(ipv4.to_string()),
            _ => None,
        })
        .collect()
}
