//! Loopback probes exercising the session library end to end.

use crate::config::InterlockConfig;
use crate::{component_debug, component_info, component_warn};
use anyhow::{anyhow, bail, Context, Result};
use interlock_session::{
    load_pem_roots, BufferPairSession, ClientSettings, EngineContext, Progress, ServerSettings,
    TlsIoError, TlsSocket,
};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use serde::Serialize;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

/// Scenario run by the probe
#[derive(clap::ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    /// Handshake against a peer that never answers
    HandshakeTimeout,
    /// Blocked read with no timeout, interrupted from another thread
    Interrupt,
    /// TLS echo round trip
    Echo,
}

/// Result of one probe run
#[derive(Serialize, Debug, Clone)]
pub struct ProbeReport {
    /// Scenario that ran
    pub mode: ProbeMode,
    /// Whether ciphertext went through in-memory buffers
    pub engine_mode: bool,
    /// Short outcome label, e.g. `timed_out`
    pub outcome: String,
    /// Whether the outcome is the expected one
    pub passed: bool,
    /// Wall time of the measured operation
    pub elapsed_ms: u64,
    /// Client session id
    pub session_id: String,
    /// Extra detail such as the echoed payload or error text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProbeReport {
    fn new(mode: ProbeMode, engine_mode: bool, session_id: String) -> Self {
        Self {
            mode,
            engine_mode,
            outcome: String::new(),
            passed: false,
            elapsed_ms: 0,
            session_id,
            detail: None,
        }
    }

    fn finish(mut self, outcome: &str, passed: bool, started: Instant) -> Self {
        self.outcome = outcome.to_string();
        self.passed = passed;
        self.elapsed_ms = started.elapsed().as_millis() as u64;
        self
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Certificates for both ends of the loopback connection
pub struct ProbePki {
    /// Server certificate and signer
    pub server: ServerSettings,
    /// Trust anchors for the client
    pub client: ClientSettings,
}

impl ProbePki {
    /// Load PEM files named in the config, or generate a throwaway CA and leaf
    pub fn load_or_generate(context: &EngineContext, config: &InterlockConfig) -> Result<Self> {
        let files = &config.tls;
        match (&files.cert_file, &files.key_file, &files.ca_file) {
            (Some(cert), Some(key), Some(ca)) => {
                let cert_pem = std::fs::read(cert)
                    .with_context(|| format!("Failed to read certificate {:?}", cert))?;
                let key_pem =
                    std::fs::read(key).with_context(|| format!("Failed to read key {:?}", key))?;
                let ca_pem =
                    std::fs::read(ca).with_context(|| format!("Failed to read CA {:?}", ca))?;
                component_info!("pki", "Loaded certificates from {:?}", cert);
                Self::from_pem(context, &cert_pem, &key_pem, &ca_pem)
            }
            (None, None, None) => Self::generate(context, &config.server_name),
            _ => bail!("tls cert_file, key_file and ca_file must be given together"),
        }
    }

    fn generate(context: &EngineContext, server_name: &str) -> Result<Self> {
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate()?;
        let ca = ca_params.self_signed(&ca_key)?;

        let leaf_key = KeyPair::generate()?;
        let leaf = CertificateParams::new(vec![server_name.to_string()])?
            .signed_by(&leaf_key, &ca, &ca_key)?;

        component_debug!("pki", "Generated throwaway certificate for {}", server_name);
        Self::from_pem(
            context,
            leaf.pem().as_bytes(),
            leaf_key.serialize_pem().as_bytes(),
            ca.pem().as_bytes(),
        )
    }

    fn from_pem(context: &EngineContext, cert: &[u8], key: &[u8], ca: &[u8]) -> Result<Self> {
        let identity = context.load_pem_identity(cert, key)?;
        let roots = load_pem_roots(ca)?;
        Ok(Self {
            server: ServerSettings {
                identity,
                client_auth_roots: None,
            },
            client: ClientSettings {
                roots,
                identity: None,
            },
        })
    }
}

/// Runs probe scenarios with one context and one set of certificates
pub struct Probe {
    context: EngineContext,
    pki: ProbePki,
    config: InterlockConfig,
}

impl Probe {
    /// Build a probe, loading or generating certificates
    pub fn new(config: InterlockConfig) -> Result<Self> {
        let context = EngineContext::new();
        let pki = ProbePki::load_or_generate(&context, &config)?;
        Ok(Self {
            context,
            pki,
            config,
        })
    }

    /// Run one scenario
    pub fn run(&self, mode: ProbeMode, engine_mode: bool) -> Result<ProbeReport> {
        component_info!(
            "probe",
            "Running {:?} probe ({} mode)",
            mode,
            if engine_mode { "engine" } else { "socket" }
        );
        match (mode, engine_mode) {
            (ProbeMode::HandshakeTimeout, false) => self.handshake_timeout(),
            (ProbeMode::HandshakeTimeout, true) => {
                bail!("handshake-timeout needs a socket; engine mode never blocks")
            }
            (ProbeMode::Interrupt, false) => self.interrupt(),
            (ProbeMode::Interrupt, true) => self.interrupt_engine(),
            (ProbeMode::Echo, false) => self.echo(),
            (ProbeMode::Echo, true) => self.echo_engine(),
        }
    }

    fn listen(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.listen_addr)
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))
    }

    fn client(&self, stream: TcpStream) -> Result<TlsSocket> {
        Ok(TlsSocket::connect(
            &self.context,
            stream,
            &self.config.server_name,
            &self.pki.client,
            &self.config.session,
        )?)
    }

    fn server(&self, listener: &TcpListener) -> Result<TlsSocket> {
        let (stream, peer) = listener.accept()?;
        component_debug!("probe", "Accepted loopback connection from {}", peer);
        let socket = TlsSocket::accept(
            &self.context,
            stream,
            &self.pki.server,
            &self.config.session,
        )?;
        socket.do_handshake(self.config.handshake_timeout_ms, None)?;
        Ok(socket)
    }

    /// Client handshake against a peer that accepts TCP and stays silent
    fn handshake_timeout(&self) -> Result<ProbeReport> {
        if self.config.handshake_timeout_ms == 0 {
            bail!("handshake-timeout needs a non-zero timeout");
        }
        let listener = self.listen()?;
        let stream = TcpStream::connect(listener.local_addr()?)?;
        let (_silent_peer, _) = listener.accept()?;

        let socket = self.client(stream)?;
        let report = ProbeReport::new(ProbeMode::HandshakeTimeout, false, socket.id().to_string());

        let started = Instant::now();
        let result = socket.do_handshake(self.config.handshake_timeout_ms, None);
        socket.close();

        let report = match result {
            Err(TlsIoError::Timeout) => {
                let early = started.elapsed() < Duration::from_millis(self.config.handshake_timeout_ms);
                report
                    .finish("timed_out", !early, started)
                    .detail(format!("timeout {}ms", self.config.handshake_timeout_ms))
            }
            Err(err) => report.finish("error", false, started).detail(err.to_string()),
            Ok(()) => report.finish("completed", false, started),
        };
        Ok(report)
    }

    /// Infinite read on an established session, interrupted after a delay
    fn interrupt(&self) -> Result<ProbeReport> {
        let listener = self.listen()?;
        let addr = listener.local_addr()?;
        let delay = Duration::from_millis(self.config.interrupt_after_ms);

        thread::scope(|s| -> Result<ProbeReport> {
            let server = s.spawn(|| -> Result<()> {
                let socket = self.server(&listener)?;
                let mut buf = [0u8; 256];
                // Held open until the client goes away
                let outcome = socket.read(&mut buf, 0, None);
                component_debug!("server", "Peer read ended with {:?}", outcome);
                socket.close();
                Ok(())
            });

            let socket = self.client(TcpStream::connect(addr)?)?;
            socket.do_handshake(self.config.handshake_timeout_ms, None)?;
            let report = ProbeReport::new(ProbeMode::Interrupt, false, socket.id().to_string());

            let started = Instant::now();
            let result = thread::scope(|inner| {
                inner.spawn(|| {
                    thread::sleep(delay);
                    component_info!("probe", "Interrupting session {}", socket.id());
                    socket.interrupt();
                });
                let mut buf = [0u8; 256];
                socket.read(&mut buf, 0, None)
            });
            socket.close();

            server
                .join()
                .map_err(|_| anyhow!("probe server thread panicked"))??;

            Ok(match result {
                Err(TlsIoError::Closed) => report.finish("interrupted", true, started),
                Err(err) => report.finish("error", false, started).detail(err.to_string()),
                Ok(progress) => report
                    .finish("returned", false, started)
                    .detail(format!("{:?}", progress)),
            })
        })
    }

    /// Echo the configured payload through a loopback TLS connection
    fn echo(&self) -> Result<ProbeReport> {
        let listener = self.listen()?;
        let addr = listener.local_addr()?;
        let payload = self.config.echo_payload.as_bytes();
        let io_timeout = self.config.io_timeout_ms;

        thread::scope(|s| -> Result<ProbeReport> {
            let server = s.spawn(|| -> Result<()> {
                let socket = self.server(&listener)?;
                let mut buf = vec![0u8; payload.len().max(1)];
                let mut received = 0;
                while received < payload.len() {
                    match socket.read(&mut buf[received..], io_timeout, None)? {
                        Progress::Bytes(n) => received += n,
                        Progress::EndOfStream | Progress::WouldBlock => break,
                    }
                }
                socket.write(&buf[..received], io_timeout, None)?;
                socket.shutdown(None)?;
                Ok(())
            });

            let socket = self.client(TcpStream::connect(addr)?)?;
            let report = ProbeReport::new(ProbeMode::Echo, false, socket.id().to_string());
            let started = Instant::now();

            let result = (|| -> Result<Vec<u8>, TlsIoError> {
                socket.do_handshake(self.config.handshake_timeout_ms, None)?;
                socket.write(payload, io_timeout, None)?;
                let mut echoed = Vec::with_capacity(payload.len());
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf, io_timeout, None)? {
                        Progress::Bytes(n) => echoed.extend_from_slice(&buf[..n]),
                        Progress::EndOfStream | Progress::WouldBlock => return Ok(echoed),
                    }
                }
            })();
            let negotiated = socket
                .handshake_info()
                .and_then(|info| info.protocol_version.clone());
            socket.close();

            server
                .join()
                .map_err(|_| anyhow!("probe server thread panicked"))??;

            Ok(echo_report(report, result, payload, negotiated, started))
        })
    }

    /// Handshake in engine mode, then interrupt before reading
    fn interrupt_engine(&self) -> Result<ProbeReport> {
        let (client, server) = self.engine_pair()?;
        let report = ProbeReport::new(ProbeMode::Interrupt, true, client.id().to_string());
        connect_engines(&client, &server)?;

        let started = Instant::now();
        client.interrupt();
        let mut buf = [0u8; 64];
        let result = client.read_plaintext(&mut buf, None);

        Ok(match result {
            Err(TlsIoError::Closed) => report.finish("interrupted", true, started),
            Err(err) => report.finish("error", false, started).detail(err.to_string()),
            Ok(progress) => report
                .finish("returned", false, started)
                .detail(format!("{:?}", progress)),
        })
    }

    /// Echo through two engine-mode sessions, moving ciphertext by hand
    fn echo_engine(&self) -> Result<ProbeReport> {
        let (client, server) = self.engine_pair()?;
        let report = ProbeReport::new(ProbeMode::Echo, true, client.id().to_string());
        let payload = self.config.echo_payload.as_bytes();

        let started = Instant::now();
        let result = (|| -> Result<Vec<u8>, TlsIoError> {
            connect_engines(&client, &server)?;
            write_all_engine(&client, &server, payload)?;
            let received = read_engine(&server, payload.len())?;
            write_all_engine(&server, &client, &received)?;
            read_engine(&client, received.len())
        })();
        let negotiated = client
            .handshake_info()
            .and_then(|info| info.protocol_version.clone());

        Ok(echo_report(report, result, payload, negotiated, started))
    }

    fn engine_pair(&self) -> Result<(BufferPairSession, BufferPairSession)> {
        let client = BufferPairSession::client(
            &self.context,
            &self.config.server_name,
            &self.pki.client,
            &self.config.session,
        )?;
        let server = BufferPairSession::server(&self.context, &self.pki.server, &self.config.session)?;
        Ok((client, server))
    }
}

fn echo_report(
    report: ProbeReport,
    result: Result<Vec<u8>, TlsIoError>,
    payload: &[u8],
    negotiated: Option<String>,
    started: Instant,
) -> ProbeReport {
    match result {
        Ok(echoed) if echoed == payload => {
            let version = negotiated.unwrap_or_else(|| "unknown".to_string());
            report
                .finish("echoed", true, started)
                .detail(format!("{} bytes over {}", echoed.len(), version))
        }
        Ok(echoed) => report.finish("mismatch", false, started).detail(format!(
            "sent {} bytes, got back {}",
            payload.len(),
            echoed.len()
        )),
        Err(err) => report.finish("error", false, started).detail(err.to_string()),
    }
}

/// Move ciphertext both ways until neither side has anything queued
fn shuttle(a: &BufferPairSession, b: &BufferPairSession) -> Result<(), TlsIoError> {
    loop {
        let mut moved = false;
        for (from, to) in [(a, b), (b, a)] {
            let chunk = from.drain_ciphertext(to.inbound_free());
            if chunk.is_empty() {
                continue;
            }
            if to.feed_ciphertext(&chunk) != chunk.len() {
                return Err(TlsIoError::InvalidArgument(
                    "peer refused ciphertext it had room for".to_string(),
                ));
            }
            moved = true;
        }
        if !moved {
            return Ok(());
        }
    }
}

const ENGINE_ROUNDS: usize = 64;

fn connect_engines(client: &BufferPairSession, server: &BufferPairSession) -> Result<(), TlsIoError> {
    for _ in 0..ENGINE_ROUNDS {
        let c = client.handshake(None)?;
        shuttle(client, server)?;
        let s = server.handshake(None)?;
        shuttle(client, server)?;
        if c == Progress::Bytes(0) && s == Progress::Bytes(0) {
            return Ok(());
        }
    }
    component_warn!("probe", "Engine-mode handshake did not converge");
    Err(TlsIoError::Timeout)
}

fn write_all_engine(
    from: &BufferPairSession,
    to: &BufferPairSession,
    mut data: &[u8],
) -> Result<(), TlsIoError> {
    for _ in 0..ENGINE_ROUNDS {
        if data.is_empty() {
            return Ok(());
        }
        if let Progress::Bytes(n) = from.write_plaintext(data, None)? {
            data = &data[n..];
        }
        shuttle(from, to)?;
    }
    Err(TlsIoError::Timeout)
}

fn read_engine(session: &BufferPairSession, expected: usize) -> Result<Vec<u8>, TlsIoError> {
    let mut received = Vec::with_capacity(expected);
    let mut buf = [0u8; 4096];
    while received.len() < expected {
        match session.read_plaintext(&mut buf, None)? {
            Progress::Bytes(n) => received.extend_from_slice(&buf[..n]),
            Progress::EndOfStream | Progress::WouldBlock => break,
        }
    }
    Ok(received)
}
