//! Relay server frontend
//!
//! Owns the two public listeners: one for control connections, one for pipe
//! connections. Control connections hand off to [`Control::establish`];
//! pipe connections perform the pipe hello, locate the owning control in
//! the registry and offer their multiplexed session to its pool.

use crate::config::{EncryptMode, ServerConfig};
use crate::control::{Control, ControlError, ControlRegistry};
use crate::crypto::{self, Opener, Sealer, DIR_CLIENT, DIR_SERVER};
use crate::msg::{self, Msg};
use crate::mux::{MuxConfig, MuxSession};
use crate::transport::{FrameReader, FrameWriter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// The relay server
pub struct Relay {
    config: ServerConfig,
    registry: ControlRegistry,
    control_listener: TcpListener,
    pipe_listener: TcpListener,
    conn_semaphore: Arc<Semaphore>,
}

impl Relay {
    /// Bind the control and pipe listeners
    pub async fn bind(config: ServerConfig) -> crate::Result<Self> {
        let control_listener = TcpListener::bind(&config.control_listen).await?;
        let pipe_listener = TcpListener::bind(&config.pipe_listen).await?;

        Ok(Self {
            registry: ControlRegistry::new(),
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            control_listener,
            pipe_listener,
        })
    }

    /// Address the control listener is bound to
    pub fn control_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.control_listener.local_addr()?)
    }

    /// Address the pipe listener is bound to
    pub fn pipe_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.pipe_listener.local_addr()?)
    }

    /// Handle to the client registry
    pub fn registry(&self) -> ControlRegistry {
        self.registry.clone()
    }

    /// Accept and dispatch connections until a listener fails
    pub async fn run(self) -> crate::Result<()> {
        info!(
            control = %self.control_addr()?,
            pipes = %self.pipe_addr()?,
            domain = %self.config.domain,
            mode = %self.config.encrypt_mode,
            "relay listening"
        );

        loop {
            tokio::select! {
                res = self.control_listener.accept() => {
                    let (conn, peer) = res?;
                    debug!(peer = %peer, "control connection");

                    let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(peer = %peer, "connection limit reached, refusing client");
                            continue;
                        }
                    };

                    let encrypt_mode = self.config.encrypt_mode;
                    let domain = self.config.domain.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        match Control::establish(conn, encrypt_mode, domain, registry).await {
                            Ok(ctl) => {
                                // The permit covers the control's whole life
                                ctl.closed().await;
                                drop(permit);
                            }
                            Err(e) => {
                                debug!(peer = %peer, "control establish failed: {}", e);
                                drop(permit);
                            }
                        }
                    });
                }
                res = self.pipe_listener.accept() => {
                    let (conn, peer) = res?;
                    debug!(peer = %peer, "pipe connection");

                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_pipe_conn(conn, registry).await {
                            debug!(peer = %peer, "pipe handshake failed: {}", e);
                        }
                    });
                }
            }
        }
    }
}

/// Pipe-channel handshake
///
/// Reads the hello, finds the owning control, derives the per-pipe session
/// key when encryption is on, and offers the resulting multiplexed session
/// to the control's pool.
async fn handle_pipe_conn(
    mut conn: TcpStream,
    registry: ControlRegistry,
) -> Result<(), ControlError> {
    conn.set_nodelay(true)?;

    let hello = {
        let mut reader = FrameReader::plain(&mut conn);
        let received = msg::read_msg(&mut reader).await?;
        match received {
            Msg::PipeClientHello(hello) => hello,
            other => {
                return Err(ControlError::Unexpected {
                    expected: "pipe_client_hello",
                    got: other.name(),
                })
            }
        }
    };

    let Some(ctl) = registry.get(&hello.client_id) else {
        return Err(ControlError::UnknownClient(hello.client_id));
    };

    let (read_half, write_half) = conn.into_split();
    let session = match ctl.encrypt_mode() {
        EncryptMode::None => MuxSession::client(
            FrameReader::plain(read_half),
            FrameWriter::plain(write_half),
            MuxConfig::default(),
        ),
        EncryptMode::Aes => {
            let key =
                crypto::derive_pipe_key(ctl.pre_master_secret(), &hello.client_id, &hello.once);
            MuxSession::client(
                FrameReader::sealed(read_half, Opener::new(&key, DIR_CLIENT)?),
                FrameWriter::sealed(write_half, Sealer::new(&key, DIR_SERVER)?),
                MuxConfig::default(),
            )
        }
    };

    debug!(client_id = %ctl.client_id(), "pipe session ready");
    ctl.put_pipe(session).await;
    Ok(())
}
