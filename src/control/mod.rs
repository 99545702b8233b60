//! Per-client control subsystem
//!
//! One [`Control`] exists per registered tunnel client. It owns the control
//! connection, the exposed tunnel listeners and the pipe pool, and runs
//! five long-lived tasks: the moderator (single point of teardown), the
//! receive and write loops, the pipe manager and the keepalive scheduler.
//!
//! Lifecycle:
//!
//! ```text
//! INIT ──handshake ok──▶ LIVE ──close req──▶ CLOSING ──moderator──▶ DEAD
//!   └──handshake fail──▶ DEAD (never registered)
//! ```

mod pool;
mod registry;

pub use registry::ControlRegistry;

use crate::config::EncryptMode;
use crate::crypto::{self, ClientId};
use crate::msg::{self, CipherKeyExchange, ClientIdExchange, Msg, MsgError};
use crate::mux::{MuxSession, MuxStream};
use crate::shutdown::Shutdown;
use crate::transport::{FrameReader, FrameWriter};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Bound on pooled idle pipes; surplus zero-stream pipes are closed
pub const MAX_IDLE_PIPES: usize = 3;

/// Stream occupancy at which a pipe counts as busy
pub const MAX_STREAMS: usize = 6;

/// Keepalive ping cadence
pub const PING_INTERVAL: Duration = Duration::from_secs(8);

/// Inbound silence after which the control is torn down
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Pool maintenance cadence
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(5);

/// How long the pipe manager waits for requested supply before asking again
pub const PIPE_REQ_TIMEOUT: Duration = Duration::from_secs(12);

/// Outgoing control frame queue capacity
const WRITE_QUEUE_CAPACITY: usize = 128;

/// Queued `get_pipe` callers the manager can hold
const PIPE_WAITER_CAPACITY: usize = 32;

/// Splice read chunk size
const SPLICE_BUF_SIZE: usize = 16 * 1024;

/// Control errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message error: {0}")]
    Msg(#[from] MsgError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Unexpected message: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Client {0} is already registered")]
    AlreadyRegistered(ClientId),

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),
}

/// One exposed tunnel
#[derive(Debug, Clone)]
pub struct Tunnel {
    /// Address the client forwards to on its side
    pub local_address: String,
    /// Public `domain:port` the relay accepts on
    pub remote_address: String,
}

/// Per-client server-side state
pub struct Control {
    client_id: ClientId,
    encrypt_mode: EncryptMode,
    pre_master_secret: Vec<u8>,
    domain: String,
    started: Instant,
    last_read_nanos: AtomicU64,
    tunnels: Mutex<Vec<Tunnel>>,
    die: Shutdown,
    to_die: mpsc::Sender<()>,
    write_tx: mpsc::Sender<Msg>,
    pipe_in_tx: mpsc::Sender<Arc<MuxSession>>,
    waiter_tx: mpsc::Sender<pool::PipeWaiter>,
    registry: ControlRegistry,
}

impl Control {
    /// Take over a freshly accepted control connection
    ///
    /// Runs the handshake (optional key exchange, identifier assignment,
    /// registration), handles tunnel sync, then starts the long-running
    /// tasks. On error the client is not left registered and the connection
    /// is dropped.
    pub async fn establish(
        conn: TcpStream,
        encrypt_mode: EncryptMode,
        domain: String,
        registry: ControlRegistry,
    ) -> Result<Arc<Self>, ControlError> {
        conn.set_nodelay(true)?;
        let (read_half, write_half) = conn.into_split();
        let mut reader = FrameReader::plain(read_half);
        let mut writer = FrameWriter::plain(write_half);

        let pre_master_secret = match encrypt_mode {
            EncryptMode::None => Vec::new(),
            EncryptMode::Aes => key_exchange(&mut reader, &mut writer).await?,
        };

        let client_id = ClientId::generate();
        msg::write_msg(&mut writer, &Msg::ClientId(ClientIdExchange { client_id })).await?;

        let (to_die_tx, to_die_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (pipe_in_tx, pipe_in_rx) = mpsc::channel(1);
        let (waiter_tx, waiter_rx) = mpsc::channel(PIPE_WAITER_CAPACITY);

        let ctl = Arc::new(Control {
            client_id,
            encrypt_mode,
            pre_master_secret,
            domain,
            started: Instant::now(),
            last_read_nanos: AtomicU64::new(0),
            tunnels: Mutex::new(Vec::new()),
            die: Shutdown::new(),
            to_die: to_die_tx,
            write_tx,
            pipe_in_tx,
            waiter_tx,
            registry: registry.clone(),
        });

        registry.register(Arc::clone(&ctl))?;
        info!(client_id = %ctl.client_id, mode = %encrypt_mode, "client registered");

        if let Err(e) = sync_tunnels(&ctl, &mut reader, &mut writer).await {
            registry.remove(&client_id);
            return Err(e);
        }

        tokio::spawn(moderator(Arc::clone(&ctl), to_die_rx));
        tokio::spawn(recv_loop(Arc::clone(&ctl), reader));
        tokio::spawn(write_loop(Arc::clone(&ctl), writer, write_rx));
        tokio::spawn(pool::pipe_manager(Arc::clone(&ctl), pipe_in_rx, waiter_rx));
        tokio::spawn(keepalive(Arc::clone(&ctl)));

        Ok(ctl)
    }

    /// The identifier assigned at handshake
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Encryption applied to this client's pipes
    pub fn encrypt_mode(&self) -> EncryptMode {
        self.encrypt_mode
    }

    /// Shared secret from the key exchange; empty when encryption is off
    pub fn pre_master_secret(&self) -> &[u8] {
        &self.pre_master_secret
    }

    /// Tunnels created during sync
    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.tunnels.lock().unwrap().clone()
    }

    /// Request teardown
    ///
    /// Offer-or-drop: never blocks, never panics, and repeated calls are
    /// no-ops once a request is pending. The moderator performs the actual
    /// teardown exactly once.
    pub fn close(&self) {
        let _ = self.to_die.try_send(());
    }

    /// Whether teardown has begun
    pub fn is_closed(&self) -> bool {
        self.die.is_signaled()
    }

    /// Wait until teardown has begun
    pub async fn closed(&self) {
        self.die.wait().await
    }

    /// Offer a fresh pipe session to the pool
    ///
    /// After death the session is closed and dropped instead.
    pub async fn put_pipe(&self, session: Arc<MuxSession>) {
        tokio::select! {
            res = self.pipe_in_tx.send(Arc::clone(&session)) => {
                if res.is_err() {
                    session.close();
                }
            }
            _ = self.die.wait() => session.close(),
        }
    }

    /// Wait for a live pipe session with free stream capacity
    ///
    /// Returns `None` once the control dies.
    pub async fn get_pipe(&self) -> Option<Arc<MuxSession>> {
        let (reply_tx, mut reply_rx) = oneshot::channel();
        tokio::select! {
            res = self.waiter_tx.send(reply_tx) => {
                if res.is_err() {
                    return None;
                }
            }
            _ = self.die.wait() => return None,
        }
        tokio::select! {
            biased;
            res = &mut reply_rx => res.ok(),
            _ = self.die.wait() => {
                // The manager may have fulfilled the waiter concurrently;
                // a session handed over at the last instant must not leak
                match reply_rx.try_recv() {
                    Ok(pipe) => {
                        pipe.close();
                        None
                    }
                    Err(_) => None,
                }
            }
        }
    }

    fn touch_last_read(&self) {
        self.last_read_nanos
            .store(self.started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Time since the last inbound control frame
    fn silence(&self) -> Duration {
        let now = self.started.elapsed().as_nanos() as u64;
        let last = self.last_read_nanos.load(Ordering::Relaxed);
        Duration::from_nanos(now.saturating_sub(last))
    }
}

/// Handle `SYNC_TUNNELS`: bind a public listener per requested tunnel and
/// echo the list back with `remote_address` filled in
///
/// Binds everything before committing; if any bind or the echo fails, the
/// listeners bound so far are dropped and nothing is exposed.
async fn sync_tunnels(
    ctl: &Arc<Control>,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) -> Result<(), ControlError> {
    let received = msg::read_msg(reader).await?;
    let Msg::SyncTunnels(mut sync) = received else {
        return Err(ControlError::Unexpected {
            expected: "sync_tunnels",
            got: received.name(),
        });
    };

    let mut bound = Vec::with_capacity(sync.tunnels.len());
    for spec in &mut sync.tunnels {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        spec.remote_address = format!("{}:{}", ctl.domain, port);
        info!(
            client_id = %ctl.client_id,
            local = %spec.local_address,
            remote = %spec.remote_address,
            "tunnel bound"
        );
        bound.push((listener, spec.clone()));
    }

    msg::write_msg(writer, &Msg::SyncTunnels(sync)).await?;

    let mut tunnels = ctl.tunnels.lock().unwrap();
    for (listener, spec) in bound {
        tunnels.push(Tunnel {
            local_address: spec.local_address.clone(),
            remote_address: spec.remote_address,
        });
        tokio::spawn(tunnel_accept_loop(
            Arc::clone(ctl),
            listener,
            spec.local_address,
        ));
    }
    Ok(())
}

/// Optional key exchange step of the handshake
async fn key_exchange(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
) -> Result<Vec<u8>, ControlError> {
    let received = msg::read_msg(reader).await?;
    let Msg::ClientKeyExchange(client_kx) = received else {
        return Err(ControlError::Unexpected {
            expected: "client_key_exchange",
            got: received.name(),
        });
    };

    let (private, server_public) = crypto::generate_key_exchange()?;
    let pre_master = crypto::process_key_exchange(private, &client_kx.cipher_key)?;

    msg::write_msg(
        writer,
        &Msg::ServerKeyExchange(CipherKeyExchange {
            cipher_key: server_public,
        }),
    )
    .await?;

    Ok(pre_master)
}

/// Single point of teardown
///
/// Waits for the first close request, then broadcasts death. Everything
/// else fans out from the broadcast: accept loops drop their listeners, the
/// recv/write loops drop the control connection halves, and the pipe
/// manager closes every pooled session.
async fn moderator(ctl: Arc<Control>, mut to_die_rx: mpsc::Receiver<()>) {
    let _ = to_die_rx.recv().await;
    info!(
        client_id = %ctl.client_id,
        tunnels = ctl.tunnels.lock().unwrap().len(),
        "client going to close"
    );
    ctl.die.signal();
    ctl.registry.remove(&ctl.client_id);
}

/// Reads control frames until death or a read error
async fn recv_loop(ctl: Arc<Control>, mut reader: FrameReader<OwnedReadHalf>) {
    ctl.touch_last_read();
    loop {
        let received = tokio::select! {
            res = msg::read_msg(&mut reader) => match res {
                Ok(received) => received,
                Err(e) => {
                    debug!(client_id = %ctl.client_id, "control read failed: {}", e);
                    ctl.close();
                    return;
                }
            },
            _ = ctl.die.wait() => return,
        };

        // Any inbound frame counts as liveness
        ctl.touch_last_read();

        match received {
            Msg::Ping => {
                tokio::select! {
                    res = ctl.write_tx.send(Msg::Pong) => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = ctl.die.wait() => return,
                }
            }
            Msg::Pong => {}
            other => trace!(client_id = %ctl.client_id, msg = other.name(), "ignoring frame"),
        }
    }
}

/// Drains the write queue onto the control connection
///
/// Keepalive frames that would follow the previous write too closely are
/// dropped; everything else is always written.
async fn write_loop(
    ctl: Arc<Control>,
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut write_rx: mpsc::Receiver<Msg>,
) {
    let mut last_write = Instant::now();
    loop {
        tokio::select! {
            queued = write_rx.recv() => {
                let Some(queued) = queued else { return };
                if queued.is_keepalive() && last_write.elapsed() < PING_INTERVAL / 2 {
                    continue;
                }
                last_write = Instant::now();
                trace!(client_id = %ctl.client_id, msg = queued.name(), "send to client");
                if let Err(e) = msg::write_msg(&mut writer, &queued).await {
                    warn!(client_id = %ctl.client_id, "control write failed: {}", e);
                    ctl.close();
                    return;
                }
            }
            _ = ctl.die.wait() => return,
        }
    }
}

/// Keepalive scheduler: pings on a cadence, kills on deadline miss
async fn keepalive(ctl: Arc<Control>) {
    let start = tokio::time::Instant::now() + PING_INTERVAL;
    let mut tick = tokio::time::interval_at(start, PING_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if ctl.silence() > PING_TIMEOUT {
                    warn!(client_id = %ctl.client_id, "keepalive deadline missed");
                    ctl.close();
                    return;
                }
                tokio::select! {
                    res = ctl.write_tx.send(Msg::Ping) => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = ctl.die.wait() => return,
                }
            }
            _ = ctl.die.wait() => return,
        }
    }
}

/// Accepts public connections for one tunnel until death
///
/// The listener is owned here and closed on exit, which the moderator's
/// broadcast triggers.
async fn tunnel_accept_loop(ctl: Arc<Control>, listener: TcpListener, local_address: String) {
    loop {
        let conn = tokio::select! {
            res = listener.accept() => match res {
                Ok((conn, peer)) => {
                    debug!(peer = %peer, tunnel = %local_address, "public connection");
                    conn
                }
                Err(e) => {
                    debug!(tunnel = %local_address, "accept failed: {}", e);
                    return;
                }
            },
            _ = ctl.die.wait() => return,
        };

        let ctl = Arc::clone(&ctl);
        let destination = local_address.clone();
        tokio::spawn(async move {
            handle_public_conn(ctl, conn, destination).await;
        });
    }
}

/// Carry one public connection over a pooled pipe
async fn handle_public_conn(ctl: Arc<Control>, conn: TcpStream, destination: String) {
    let Some(pipe) = ctl.get_pipe().await else {
        return;
    };

    let stream = match pipe.open_stream(&destination).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(dest = %destination, "open stream failed: {}", e);
            ctl.put_pipe(pipe).await;
            return;
        }
    };

    // Return the pipe before splicing: the stream's lifetime is its own,
    // and the pipe can carry other connections meanwhile
    ctl.put_pipe(pipe).await;

    splice(conn, stream).await;
}

/// Copy bytes both ways until either direction finishes
async fn splice(conn: TcpStream, stream: MuxStream) {
    let _ = conn.set_nodelay(true);
    let (mut conn_read, mut conn_write) = conn.into_split();
    let (stream_write, mut stream_read) = stream.into_split();
    let closer = stream_write.clone();

    let mut inbound = tokio::spawn(async move {
        let mut buf = vec![0u8; SPLICE_BUF_SIZE];
        loop {
            match conn_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream_write
                        .write(Bytes::copy_from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let mut outbound = tokio::spawn(async move {
        while let Some(data) = stream_read.read().await {
            if conn_write.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut inbound => outbound.abort(),
        _ = &mut outbound => inbound.abort(),
    }
    closer.close().await;
}
