//! Control-channel messages
//!
//! Every message rides in one transport frame:
//!
//! ```text
//! +--------+----------------------------+
//! |  Type  |      JSON body (opt)       |
//! +--------+----------------------------+
//! ```
//!
//! `PING`, `PONG` and `PIPE_REQ` carry no body. Unknown type bytes decode to
//! [`Msg::Unknown`] so receivers can skip them.

use crate::crypto::ClientId;
use crate::transport::{FrameReader, FrameWriter, TransportError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Message errors
#[derive(Debug, Error)]
pub enum MsgError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Body error: {0}")]
    Body(#[from] serde_json::Error),

    #[error("Unexpected message: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

mod wire {
    pub const CLIENT_KEY_EXCHANGE: u8 = 1;
    pub const SERVER_KEY_EXCHANGE: u8 = 2;
    pub const CLIENT_ID: u8 = 3;
    pub const SYNC_TUNNELS: u8 = 4;
    pub const PING: u8 = 5;
    pub const PONG: u8 = 6;
    pub const PIPE_REQ: u8 = 7;
    pub const PIPE_CLIENT_HELLO: u8 = 8;
}

/// Public value of one side of the key exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherKeyExchange {
    pub cipher_key: Vec<u8>,
}

/// Server-assigned client identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdExchange {
    pub client_id: ClientId,
}

/// One requested tunnel
///
/// The client fills `local_address`; the server assigns `remote_address`
/// when it binds the public listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub local_address: String,
    #[serde(default)]
    pub remote_address: String,
}

/// Tunnel list exchanged during sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTunnels {
    pub tunnels: Vec<TunnelSpec>,
}

/// First message on a fresh pipe connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeClientHello {
    pub client_id: ClientId,
    pub once: [u8; 16],
}

/// A control-channel message
#[derive(Debug, Clone)]
pub enum Msg {
    ClientKeyExchange(CipherKeyExchange),
    ServerKeyExchange(CipherKeyExchange),
    ClientId(ClientIdExchange),
    SyncTunnels(SyncTunnels),
    Ping,
    Pong,
    PipeReq,
    PipeClientHello(PipeClientHello),
    /// Unrecognized type byte; ignored on receive
    Unknown(u8),
}

impl Msg {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Msg::ClientKeyExchange(_) => "client_key_exchange",
            Msg::ServerKeyExchange(_) => "server_key_exchange",
            Msg::ClientId(_) => "client_id",
            Msg::SyncTunnels(_) => "sync_tunnels",
            Msg::Ping => "ping",
            Msg::Pong => "pong",
            Msg::PipeReq => "pipe_req",
            Msg::PipeClientHello(_) => "pipe_client_hello",
            Msg::Unknown(_) => "unknown",
        }
    }

    /// Whether this is a keepalive frame
    pub fn is_keepalive(&self) -> bool {
        matches!(self, Msg::Ping | Msg::Pong)
    }

    /// Encode into a frame payload
    pub fn encode(&self) -> Result<Vec<u8>, MsgError> {
        let (type_byte, body) = match self {
            Msg::ClientKeyExchange(b) => (wire::CLIENT_KEY_EXCHANGE, Some(serde_json::to_vec(b)?)),
            Msg::ServerKeyExchange(b) => (wire::SERVER_KEY_EXCHANGE, Some(serde_json::to_vec(b)?)),
            Msg::ClientId(b) => (wire::CLIENT_ID, Some(serde_json::to_vec(b)?)),
            Msg::SyncTunnels(b) => (wire::SYNC_TUNNELS, Some(serde_json::to_vec(b)?)),
            Msg::Ping => (wire::PING, None),
            Msg::Pong => (wire::PONG, None),
            Msg::PipeReq => (wire::PIPE_REQ, None),
            Msg::PipeClientHello(b) => (wire::PIPE_CLIENT_HELLO, Some(serde_json::to_vec(b)?)),
            Msg::Unknown(t) => (*t, None),
        };

        let mut payload = Vec::with_capacity(1 + body.as_ref().map_or(0, Vec::len));
        payload.push(type_byte);
        if let Some(body) = body {
            payload.extend_from_slice(&body);
        }
        Ok(payload)
    }

    /// Decode from a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, MsgError> {
        let Some((&type_byte, body)) = payload.split_first() else {
            return Err(MsgError::Transport(TransportError::EmptyFrame));
        };
        Ok(match type_byte {
            wire::CLIENT_KEY_EXCHANGE => Msg::ClientKeyExchange(serde_json::from_slice(body)?),
            wire::SERVER_KEY_EXCHANGE => Msg::ServerKeyExchange(serde_json::from_slice(body)?),
            wire::CLIENT_ID => Msg::ClientId(serde_json::from_slice(body)?),
            wire::SYNC_TUNNELS => Msg::SyncTunnels(serde_json::from_slice(body)?),
            wire::PING => Msg::Ping,
            wire::PONG => Msg::Pong,
            wire::PIPE_REQ => Msg::PipeReq,
            wire::PIPE_CLIENT_HELLO => Msg::PipeClientHello(serde_json::from_slice(body)?),
            other => Msg::Unknown(other),
        })
    }
}

/// Read one message from a framed transport
pub async fn read_msg<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<Msg, MsgError> {
    let frame = reader.read_frame().await?;
    Msg::decode(&frame)
}

/// Write one message to a framed transport
pub async fn write_msg<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    msg: &Msg,
) -> Result<(), MsgError> {
    let payload = msg.encode()?;
    writer.write_frame(&payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_tunnels_roundtrip() {
        let msg = Msg::SyncTunnels(SyncTunnels {
            tunnels: vec![TunnelSpec {
                local_address: "127.0.0.1:22".to_string(),
                remote_address: String::new(),
            }],
        });

        let payload = msg.encode().unwrap();
        match Msg::decode(&payload).unwrap() {
            Msg::SyncTunnels(sync) => {
                assert_eq!(sync.tunnels.len(), 1);
                assert_eq!(sync.tunnels[0].local_address, "127.0.0.1:22");
                assert!(sync.tunnels[0].remote_address.is_empty());
            }
            other => panic!("wrong message: {}", other.name()),
        }
    }

    #[test]
    fn test_bodyless_messages() {
        for msg in [Msg::Ping, Msg::Pong, Msg::PipeReq] {
            let payload = msg.encode().unwrap();
            assert_eq!(payload.len(), 1);
            let decoded = Msg::decode(&payload).unwrap();
            assert_eq!(decoded.name(), msg.name());
        }
    }

    #[test]
    fn test_unknown_type_tolerated() {
        let decoded = Msg::decode(&[0xEE, b'x', b'y']).unwrap();
        assert!(matches!(decoded, Msg::Unknown(0xEE)));
    }

    #[test]
    fn test_pipe_hello_carries_nonce() {
        let hello = PipeClientHello {
            client_id: ClientId::generate(),
            once: [3u8; 16],
        };
        let payload = Msg::PipeClientHello(hello.clone()).encode().unwrap();
        match Msg::decode(&payload).unwrap() {
            Msg::PipeClientHello(h) => {
                assert_eq!(h.client_id, hello.client_id);
                assert_eq!(h.once, hello.once);
            }
            other => panic!("wrong message: {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_read_write_over_transport() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::plain(client);
        let mut reader = FrameReader::plain(server);

        write_msg(&mut writer, &Msg::PipeReq).await.unwrap();
        let msg = read_msg(&mut reader).await.unwrap();
        assert!(matches!(msg, Msg::PipeReq));
    }
}
