//! Proxy server
//!
//! The acceptor runs on the main runtime and hands every accepted socket to
//! a worker thread, round robin. Each worker owns a single-threaded runtime,
//! so a session and both of its sockets stay on one thread for their whole
//! life. Inside a session the loop waits for socket readiness and drives the
//! backend protocol state through its reactor callbacks.

use crate::config::ServerConfig;
use crate::connection::{configure_tcp_keepalive, ConnectionRegistry};
use crate::errors::{backend_unavailable, classify_protocol_error, is_quiet_session_end, ClassifiedError};
use crate::pool::BackendPool;
use anyhow::{Context, Result};
use gatewire_common::config::ProxySettings;
use gatewire_protocol::constants::command::{self, COM_QUIT};
use gatewire_protocol::constants::{REPLY_ERR, REPLY_OK};
use gatewire_protocol::{
    messages, BackendConnection, ConnectionHandler, Packet, PacketFramer, ProtocolError, WriteQueue,
};
use std::future::Future;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Server asks for more authentication data
const AUTH_MORE_DATA: u8 = 0x01;
/// AuthMoreData status: cached credentials accepted, OK follows without a client reply
const FAST_AUTH_SUCCESS: u8 = 0x03;

/// State shared by the acceptor and all workers
#[derive(Debug)]
pub struct SessionContext {
    pub config: ServerConfig,
    pub pool: BackendPool,
    pub registry: ConnectionRegistry,
}

pub struct ProxyServer {
    listen_addr: SocketAddr,
    workers: usize,
    context: Arc<SessionContext>,
}

impl ProxyServer {
    pub fn new(settings: &ProxySettings, config: ServerConfig) -> Self {
        Self {
            listen_addr: settings.listen_addr,
            workers: settings.workers.max(1),
            context: Arc::new(SessionContext {
                config,
                pool: BackendPool::new(settings.backends.clone()),
                registry: ConnectionRegistry::new(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.listen_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "Gatewire proxy listening on {} ({} workers, {} backends)",
            listener.local_addr()?,
            self.workers,
            self.context.pool.len()
        );

        let mut workers = WorkerPool::start(self.workers, self.context.clone())?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    debug!("New client connection from {}", peer);

                    // Workers re-register the socket with their own runtime
                    match socket.into_std() {
                        Ok(socket) => workers.dispatch(socket, peer),
                        Err(e) => warn!("Failed to detach socket from {}: {}", peer, e),
                    }
                }
            }
        }

        let open = self.context.registry.len();
        if open > 0 {
            warn!(
                "Closing {} open sessions (per worker: {:?})",
                open,
                self.context.registry.per_worker(self.workers)
            );
            for info in self.context.registry.snapshot() {
                debug!(
                    session = %info.id,
                    peer = %info.peer,
                    backend = info.backend.as_deref().unwrap_or("-"),
                    age_secs = info.started.elapsed().as_secs(),
                    "Open session"
                );
            }
        }
        workers.shutdown().await;
        Ok(())
    }
}

struct Accepted {
    socket: std::net::TcpStream,
    peer: SocketAddr,
}

/// Worker threads, each running its own single-threaded runtime
struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<Accepted>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
}

impl WorkerPool {
    fn start(count: usize, context: Arc<SessionContext>) -> Result<Self> {
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let context = context.clone();
            let handle = std::thread::Builder::new()
                .name(format!("gatewire-worker-{}", index))
                .spawn(move || run_worker(index, rx, context))
                .with_context(|| format!("failed to spawn worker {}", index))?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            senders,
            handles,
            next: 0,
        })
    }

    /// Hand a connection to the next worker that is still running
    fn dispatch(&mut self, socket: std::net::TcpStream, peer: SocketAddr) {
        let mut accepted = Accepted { socket, peer };
        for _ in 0..self.senders.len() {
            let index = self.next % self.senders.len();
            self.next = self.next.wrapping_add(1);
            match self.senders[index].send(accepted) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    error!(worker = index, "Worker is gone, trying the next one");
                    accepted = returned;
                }
            }
        }
        error!("No worker available, dropping connection from {}", accepted.peer);
    }

    async fn shutdown(self) {
        drop(self.senders);
        let handles = self.handles;
        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    error!("Worker thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            error!("Failed to join workers: {}", e);
        }
    }
}

fn run_worker(index: usize, mut rx: mpsc::UnboundedReceiver<Accepted>, context: Arc<SessionContext>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker = index, "Failed to start worker runtime: {}", e);
            return;
        }
    };

    debug!(worker = index, "Worker started");
    runtime.block_on(async move {
        while let Some(Accepted { socket, peer }) = rx.recv().await {
            let context = context.clone();
            tokio::spawn(async move {
                run_session(index, socket, peer, context).await;
            });
        }
    });
    debug!(worker = index, "Worker stopped");
}

/// Why a session ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ClientQuit,
    ClientClosed,
    BackendClosed,
}

async fn run_session(worker: usize, socket: std::net::TcpStream, peer: SocketAddr, context: Arc<SessionContext>) {
    let id = context.registry.register(peer, worker);

    match serve_session(id, socket, &context).await {
        Ok(end) => debug!(session = %id, peer = %peer, "Session closed: {:?}", end),
        Err(e) if is_quiet_session_end(&e) => {
            debug!(session = %id, peer = %peer, "Client disconnected: {:#}", e)
        }
        Err(e) => error!(session = %id, peer = %peer, "Session failed: {:#}", e),
    }

    context.registry.unregister(&id);
}

async fn serve_session(id: Uuid, socket: std::net::TcpStream, context: &SessionContext) -> Result<SessionEnd> {
    let client = TcpStream::from_std(socket)?;
    configure_tcp_keepalive(&client, context.config.tcp_keepalive_secs);
    let session = Session::establish(id, client, context).await?;
    session.relay().await
}

/// Connect to the first backend that accepts, in pool order
async fn connect_backend(context: &SessionContext) -> std::result::Result<(TcpStream, String), ClassifiedError> {
    let timeout = Duration::from_secs(context.config.backend_connect_timeout_secs);
    let mut last_error = String::from("no backends configured");

    for index in context.pool.candidates() {
        let Some(entry) = context.pool.get(index) else {
            continue;
        };
        let name = entry.address.name();
        let connect = TcpStream::connect((entry.address.host.as_str(), entry.address.port));

        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => {
                context.pool.mark_up(index);
                return Ok((stream, name));
            }
            Ok(Err(e)) => {
                warn!(backend = %name, "Backend connect failed: {}", e);
                last_error = format!("{}: {}", name, e);
            }
            Err(_) => {
                warn!(backend = %name, "Backend connect timed out");
                last_error = format!("{}: connect timed out after {}s", name, timeout.as_secs());
            }
        }
        context.pool.mark_down(index);
    }

    Err(backend_unavailable(&last_error))
}

/// Read one complete packet, or `None` if the peer closed first
async fn read_packet(stream: &mut TcpStream, framer: &mut PacketFramer, buf: &mut [u8]) -> io::Result<Option<Packet>> {
    loop {
        if let Some(packet) = framer.next_packet() {
            return Ok(Some(packet));
        }
        let n = stream.read(buf).await?;
        if n == 0 {
            return Ok(None);
        }
        framer.feed(&buf[..n]);
    }
}

/// Readiness a session waits for in one turn of its relay loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interest {
    read_client: bool,
    read_backend: bool,
    write_client: bool,
    write_backend: bool,
}

impl Interest {
    /// Reads from a peer pause while the queue it feeds is throttled
    fn of(client_queue: &WriteQueue, backend_queue: &WriteQueue) -> Self {
        Self {
            read_client: !backend_queue.is_throttled(),
            read_backend: !client_queue.is_throttled(),
            write_client: !client_queue.is_empty(),
            write_backend: !backend_queue.is_empty(),
        }
    }
}

/// One client session and its backend connection
struct Session {
    id: Uuid,
    client: TcpStream,
    backend_stream: TcpStream,
    backend: BackendConnection,
    client_framer: PacketFramer,
    client_queue: WriteQueue,
    read_buf: Vec<u8>,
}

impl Session {
    /// Connect a backend and relay the connection handshake between the two
    async fn establish(id: Uuid, mut client: TcpStream, context: &SessionContext) -> Result<Self> {
        let (backend_stream, backend_name) = match connect_backend(context).await {
            Ok(connected) => connected,
            Err(err) => {
                // The client has not seen a greeting yet, so this is packet 0
                let packet = messages::err_packet(0, err.code, err.sql_state, &err.message);
                client.write_all(packet.as_bytes()).await.ok();
                anyhow::bail!("{} ({})", err.message, err.category);
            }
        };
        configure_tcp_keepalive(&backend_stream, context.config.tcp_keepalive_secs);
        context.registry.set_backend(&id, &backend_name);
        info!(session = %id, backend = %backend_name, "Session connected to backend");

        let mut session = Self {
            id,
            client,
            backend_stream,
            backend: BackendConnection::with_config(backend_name, context.config.backend_backpressure.clone()),
            client_framer: PacketFramer::new(),
            client_queue: WriteQueue::new(context.config.client_backpressure.clone()),
            read_buf: vec![0; context.config.read_buffer_size],
        };
        session.relay_handshake().await?;
        Ok(session)
    }

    /// Pass handshake packets through unchanged until the backend accepts
    /// or refuses the client
    async fn relay_handshake(&mut self) -> Result<()> {
        let mut backend_framer = PacketFramer::new();

        let greeting = read_packet(&mut self.backend_stream, &mut backend_framer, &mut self.read_buf)
            .await?
            .context("backend closed before sending its greeting")?;
        self.client.write_all(greeting.as_bytes()).await?;
        if greeting.command() == Some(REPLY_ERR) {
            anyhow::bail!("backend {} refused the connection", self.backend.name());
        }

        let mut await_client = true;
        loop {
            if await_client {
                let response = read_packet(&mut self.client, &mut self.client_framer, &mut self.read_buf)
                    .await?
                    .context("client closed during handshake")?;
                self.backend_stream.write_all(response.as_bytes()).await?;
            }

            let answer = read_packet(&mut self.backend_stream, &mut backend_framer, &mut self.read_buf)
                .await?
                .context("backend closed during handshake")?;
            self.client.write_all(answer.as_bytes()).await?;

            match answer.command() {
                Some(REPLY_OK) => break,
                Some(REPLY_ERR) => {
                    anyhow::bail!("backend {} rejected the client's credentials", self.backend.name())
                }
                Some(AUTH_MORE_DATA) if answer.payload().get(1) == Some(&FAST_AUTH_SUCCESS) => {
                    await_client = false;
                }
                _ => await_client = true,
            }
        }

        if backend_framer.buffered_len() > 0 {
            // Nothing may follow the OK before the first command
            warn!(
                session = %self.id,
                bytes = backend_framer.buffered_len(),
                "Backend sent data after the handshake; discarding"
            );
        }
        debug!(session = %self.id, "Handshake complete");
        Ok(())
    }

    /// Command phase: shuttle bytes until one side goes away
    ///
    /// Some arm is always enabled: a throttled queue is never empty, so
    /// whenever a read is paused the matching write is armed.
    async fn relay(mut self) -> Result<SessionEnd> {
        // The client may have sent its first command together with the last
        // handshake packet
        if let Some(end) = self.forward_client_packets()? {
            return self.finish(end);
        }

        loop {
            let interest = Interest::of(&self.client_queue, self.backend.outbound());

            let end = tokio::select! {
                ready = self.client.readable(), if interest.read_client => {
                    ready?;
                    self.on_client_readable()?
                }
                ready = self.backend_stream.readable(), if interest.read_backend => {
                    ready?;
                    self.on_backend_readable()?
                }
                ready = self.client.writable(), if interest.write_client => {
                    ready?;
                    self.flush_client()?;
                    None
                }
                ready = self.backend_stream.writable(), if interest.write_backend => {
                    ready?;
                    self.flush_backend()?;
                    None
                }
            };

            if let Some(end) = end {
                return self.finish(end);
            }
        }
    }

    fn on_client_readable(&mut self) -> Result<Option<SessionEnd>> {
        match self.client.try_read(&mut self.read_buf) {
            Ok(0) => Ok(Some(SessionEnd::ClientClosed)),
            Ok(n) => {
                self.client_framer.feed(&self.read_buf[..n]);
                self.forward_client_packets()
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("reading from client"),
        }
    }

    fn forward_client_packets(&mut self) -> Result<Option<SessionEnd>> {
        while let Some(packet) = self.client_framer.next_packet() {
            if let Some(end) = self.forward_command(packet)? {
                return Ok(Some(end));
            }
        }
        self.flush_backend()?;
        self.flush_client()?;
        Ok(None)
    }

    fn forward_command(&mut self, packet: Packet) -> Result<Option<SessionEnd>> {
        // Continuation and file data packets carry no command byte
        let in_command = !self.backend.is_large_query_active() && !self.backend.is_load_data_active();
        let cmd = packet.command().filter(|_| in_command);
        let sequence = packet.sequence();

        if cmd == Some(COM_QUIT) {
            self.backend.write(packet, false)?;
            self.flush_backend().ok();
            return Ok(Some(SessionEnd::ClientQuit));
        }

        trace!(
            session = %self.id,
            command = cmd.map(command::name).unwrap_or("DATA"),
            "Client packet"
        );

        match self.backend.write_command(packet) {
            Ok(()) => Ok(None),
            Err(err) if err.is_fatal() => Err(err).context("forwarding client command"),
            Err(err) => {
                let classified = classify_protocol_error(&err);
                warn!(
                    session = %self.id,
                    category = %classified.category,
                    "Rejected client command: {}",
                    err
                );
                if cmd.is_some_and(command::will_respond) {
                    self.client_queue.push(classified.to_packet(sequence).into_bytes());
                }
                Ok(None)
            }
        }
    }

    fn on_backend_readable(&mut self) -> Result<Option<SessionEnd>> {
        let n = match self.backend_stream.try_read(&mut self.read_buf) {
            Ok(0) => return Ok(Some(SessionEnd::BackendClosed)),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e).context("reading from backend"),
        };

        let batch = self.backend.on_readable(&self.read_buf[..n]);
        if !batch.forward.is_empty() {
            self.client_queue.push(batch.forward.freeze());
        }
        if batch.response_ready {
            trace!(session = %self.id, results = batch.results_completed, "Response complete");
        }
        if batch.local_infile_requested {
            debug!(session = %self.id, "Backend requested a local file from the client");
        }
        for err in &batch.errors {
            debug!(session = %self.id, "Backend protocol error: {}", err);
        }
        if let Some(fatal) = batch.errors.into_iter().find(ProtocolError::is_fatal) {
            return Err(fatal).context("processing backend reply");
        }

        self.flush_client()?;
        Ok(None)
    }

    fn flush_client(&mut self) -> Result<()> {
        let client = &self.client;
        self.client_queue
            .drain_with(|slices| client.try_write_vectored(slices))
            .context("writing to client")?;
        Ok(())
    }

    fn flush_backend(&mut self) -> Result<()> {
        let stream = &self.backend_stream;
        let mut write = |slices: &[IoSlice<'_>]| stream.try_write_vectored(slices);
        self.backend
            .on_writable(&mut write)
            .context("writing to backend")?;
        Ok(())
    }

    fn finish(mut self, end: SessionEnd) -> Result<SessionEnd> {
        let stats = self.backend.stats();
        let client_stats = self.client_queue.stats();
        self.backend.on_hangup();
        debug!(
            session = %self.id,
            commands = stats.commands_written,
            responses = stats.responses,
            client_bytes = client_stats.bytes_written,
            client_peak_queued = client_stats.peak_queued,
            "Session finished"
        );
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewire_common::config::TelemetrySettings;
    use gatewire_protocol::constants::command::{COM_QUERY, COM_STMT_EXECUTE, COM_STMT_PREPARE};
    use gatewire_protocol::constants::SERVER_STATUS_AUTOCOMMIT;
    use gatewire_protocol::messages::{command_packet, parse_err_payload, statement_command};
    use gatewire_protocol::BackpressureConfig;
    use tokio::sync::oneshot;

    const BACKEND_STATEMENT_ID: u32 = 77;

    /// Minimal backend: greets, accepts any credentials, answers a few commands
    async fn fake_backend(listener: TcpListener) {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut framer = PacketFramer::new();
        let mut buf = vec![0u8; 4096];

        let greeting = Packet::new(0, b"\x0a8.0.0-fake\0");
        if stream.write_all(greeting.as_bytes()).await.is_err() {
            return;
        }
        if !matches!(read_packet(&mut stream, &mut framer, &mut buf).await, Ok(Some(_))) {
            return;
        }
        let ok = messages::ok_packet(2, 0, 0, SERVER_STATUS_AUTOCOMMIT, 0);
        if stream.write_all(ok.as_bytes()).await.is_err() {
            return;
        }

        while let Ok(Some(packet)) = read_packet(&mut stream, &mut framer, &mut buf).await {
            let replies = match packet.command() {
                Some(COM_QUERY) => vec![
                    messages::column_count_packet(1, 1),
                    messages::column_definition_packet(2, "a"),
                    messages::eof_packet(3, 0, SERVER_STATUS_AUTOCOMMIT),
                    messages::text_row_packet(4, &[Some("1")]),
                    messages::eof_packet(5, 0, SERVER_STATUS_AUTOCOMMIT),
                ],
                Some(COM_STMT_PREPARE) => {
                    vec![messages::prepare_ok_packet(1, BACKEND_STATEMENT_ID, 0, 0, 0)]
                }
                Some(COM_STMT_EXECUTE) => {
                    let id = u32::from_le_bytes(packet.payload()[1..5].try_into().unwrap());
                    if id == BACKEND_STATEMENT_ID {
                        vec![messages::ok_packet(1, 1, 0, SERVER_STATUS_AUTOCOMMIT, 0)]
                    } else {
                        vec![messages::err_packet(1, 9999, "HY000", "wrong handle")]
                    }
                }
                Some(COM_QUIT) | None => break,
                _ => vec![messages::ok_packet(1, 0, 0, SERVER_STATUS_AUTOCOMMIT, 0)],
            };
            for reply in replies {
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            backend_connect_timeout_secs: 2,
            ..ServerConfig::default()
        }
    }

    async fn start_proxy(backend: SocketAddr) -> (SocketAddr, oneshot::Sender<()>, Arc<SessionContext>) {
        let settings = ProxySettings {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            backends: vec![format!("127.0.0.1:{}", backend.port()).parse().unwrap()],
            workers: 2,
            telemetry: TelemetrySettings::default(),
        };
        let server = ProxyServer::new(&settings, test_config());
        let context = server.context().clone();
        let listener = TcpListener::bind(settings.listen_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .serve(listener, async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });
        (addr, tx, context)
    }

    struct TestClient {
        stream: TcpStream,
        framer: PacketFramer,
        buf: Vec<u8>,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                framer: PacketFramer::new(),
                buf: vec![0; 4096],
            }
        }

        async fn send(&mut self, packet: Packet) {
            self.stream.write_all(packet.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Packet {
            read_packet(&mut self.stream, &mut self.framer, &mut self.buf)
                .await
                .unwrap()
                .expect("proxy closed the connection")
        }

        async fn login(&mut self) {
            let greeting = self.recv().await;
            assert_eq!(greeting.sequence(), 0);
            self.send(Packet::new(1, b"credentials")).await;
            let ok = self.recv().await;
            assert_eq!(ok.command(), Some(REPLY_OK));
        }
    }

    #[tokio::test]
    async fn test_query_and_prepared_statements_relay() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(fake_backend(backend));

        let (proxy_addr, shutdown, _context) = start_proxy(backend_addr).await;
        let mut client = TestClient::connect(proxy_addr).await;
        client.login().await;

        client.send(command_packet(COM_QUERY, b"SELECT 1")).await;
        let mut packets = Vec::new();
        for _ in 0..5 {
            packets.push(client.recv().await);
        }
        assert_eq!(packets[3].payload(), &[1, b'1']);
        assert_eq!(packets[4].sequence(), 5);

        client.send(command_packet(COM_STMT_PREPARE, b"SELECT ?")).await;
        let prepared = client.recv().await;
        assert_eq!(prepared.command(), Some(REPLY_OK));
        let client_id = u32::from_le_bytes(prepared.payload()[1..5].try_into().unwrap());
        assert_ne!(client_id, BACKEND_STATEMENT_ID);

        // The backend only answers OK when it receives its own handle
        client
            .send(statement_command(COM_STMT_EXECUTE, client_id, &[0, 1, 0, 0, 0]))
            .await;
        assert_eq!(client.recv().await.command(), Some(REPLY_OK));

        client
            .send(statement_command(COM_STMT_EXECUTE, client_id + 100, &[0, 1, 0, 0, 0]))
            .await;
        let err = client.recv().await;
        assert_eq!(err.sequence(), 1);
        let parsed = parse_err_payload(err.payload()).unwrap();
        assert_eq!(parsed.code, 1243);

        // The session is still usable afterwards
        client.send(command_packet(COM_QUERY, b"SELECT 1")).await;
        for _ in 0..5 {
            client.recv().await;
        }

        client.send(command_packet(COM_QUIT, b"")).await;
        let n = client.stream.read(&mut client.buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        shutdown.send(()).unwrap();
    }

    fn small_queue_config() -> BackpressureConfig {
        BackpressureConfig {
            high_water_bytes: 64,
            low_water_bytes: 16,
            max_iovecs: 8,
        }
    }

    #[test]
    fn test_client_reads_pause_while_backend_queue_is_full() {
        let client_queue = WriteQueue::new(small_queue_config());
        let mut backend = BackendConnection::with_config("db", small_queue_config());

        let idle = Interest::of(&client_queue, backend.outbound());
        assert!(idle.read_client && idle.read_backend);
        assert!(!idle.write_client && !idle.write_backend);

        backend
            .write(command_packet(COM_QUERY, &[b'x'; 200]), true)
            .unwrap();
        let full = Interest::of(&client_queue, backend.outbound());
        assert!(!full.read_client);
        assert!(full.write_backend);
        assert!(full.read_backend);

        let mut accept_all =
            |slices: &[IoSlice<'_>]| -> io::Result<usize> { Ok(slices.iter().map(|s| s.len()).sum()) };
        backend.flush(&mut accept_all).unwrap();
        let drained = Interest::of(&client_queue, backend.outbound());
        assert_eq!(drained, idle);
    }

    #[test]
    fn test_backend_reads_pause_while_client_queue_is_full() {
        let mut client_queue = WriteQueue::new(small_queue_config());
        let backend = BackendConnection::with_config("db", small_queue_config());

        let wide = "y".repeat(100);
        client_queue.push(messages::text_row_packet(4, &[Some(wide.as_str())]).into_bytes());
        let interest = Interest::of(&client_queue, backend.outbound());
        assert!(!interest.read_backend);
        assert!(interest.write_client);
        assert!(interest.read_client);
    }

    #[tokio::test]
    async fn test_unavailable_backend_answers_with_error() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let (proxy_addr, shutdown, context) = start_proxy(closed_addr).await;
        let mut client = TestClient::connect(proxy_addr).await;

        let err = client.recv().await;
        assert_eq!(err.sequence(), 0);
        assert_eq!(err.command(), Some(REPLY_ERR));
        let parsed = parse_err_payload(err.payload()).unwrap();
        assert_eq!(parsed.code, 2003);
        assert!(parsed.message.contains("No backend server available"));

        assert_eq!(context.pool.healthy_count(), 0);
        shutdown.send(()).unwrap();
    }
}
