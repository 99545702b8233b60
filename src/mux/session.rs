//! Multiplexed session over one pipe connection
//!
//! A session is driven by a single task that owns the transport halves and
//! the stream table. Handles only talk to the driver through channels, so
//! stream bookkeeping is single-owner; the pool observes a session through
//! the atomic stream count and closed flag.

use super::frame::{Frame, FrameType, MAX_DATA_LEN};
use super::stream::MuxStream;
use super::{MuxError, DEFAULT_RECEIVE_BUFFER};
use crate::shutdown::Shutdown;
use crate::transport::{FrameReader, FrameWriter};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

const CMD_CHANNEL_SIZE: usize = 256;

/// Session tuning
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Bound on inbound data buffered per stream before the driver stalls
    pub max_receive_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_receive_buffer: DEFAULT_RECEIVE_BUFFER,
        }
    }
}

/// Command sent from handles to the session driver
pub(crate) enum MuxCmd {
    Open {
        destination: String,
        reply: oneshot::Sender<Result<MuxStream, MuxError>>,
    },
    Data {
        stream_id: u32,
        data: Bytes,
    },
    CloseStream {
        stream_id: u32,
    },
}

/// Handle to a multiplexed session
///
/// Cheap to share; all methods are safe to call from any task.
pub struct MuxSession {
    cmd_tx: mpsc::Sender<MuxCmd>,
    stream_count: Arc<AtomicUsize>,
    closed: Arc<Shutdown>,
}

impl MuxSession {
    /// Start a client-side session over a framed transport
    ///
    /// "Client" here means the stream-opening side: the relay opens streams
    /// toward the tunnel client, which accepts them.
    pub fn client<R, W>(reader: FrameReader<R>, writer: FrameWriter<W>, config: MuxConfig) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let stream_count = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(Shutdown::new());

        let driver = Driver {
            reader,
            writer,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            streams: HashMap::new(),
            next_stream_id: 1,
            stream_count: Arc::clone(&stream_count),
            closed: Arc::clone(&closed),
            data_channel_cap: (config.max_receive_buffer / MAX_DATA_LEN).max(1),
        };
        tokio::spawn(driver.run());

        Arc::new(Self {
            cmd_tx,
            stream_count,
            closed,
        })
    }

    /// Open a new stream targeted at `destination` on the far side
    pub async fn open_stream(&self, destination: &str) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCmd::Open {
                destination: destination.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| MuxError::SessionClosed)?;

        reply_rx.await.map_err(|_| MuxError::SessionClosed)?
    }

    /// Number of currently open streams
    pub fn num_streams(&self) -> usize {
        self.stream_count.load(Ordering::Relaxed)
    }

    /// Whether the session has terminated
    pub fn is_closed(&self) -> bool {
        self.closed.is_signaled()
    }

    /// Terminate the session
    ///
    /// Idempotent. The driver notices the flag, sends a best-effort go-away
    /// and drops the transport; streams see end-of-stream.
    pub fn close(&self) {
        self.closed.signal();
    }
}

struct Driver<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    cmd_rx: mpsc::Receiver<MuxCmd>,
    cmd_tx: mpsc::Sender<MuxCmd>,
    streams: HashMap<u32, mpsc::Sender<Bytes>>,
    next_stream_id: u32,
    stream_count: Arc<AtomicUsize>,
    closed: Arc<Shutdown>,
    data_channel_cap: usize,
}

impl<R, W> Driver<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                frame = self.reader.read_frame() => {
                    let frame = match frame {
                        Ok(buf) => match Frame::decode(buf) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!("session: bad frame: {}", e);
                                break;
                            }
                        },
                        Err(e) => {
                            trace!("session: transport closed: {}", e);
                            break;
                        }
                    };
                    if self.handle_frame(frame).await.is_err() {
                        break;
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_cmd(cmd).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = self.closed.wait() => break,
            }
        }

        self.finish().await;
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        match frame.frame_type {
            FrameType::Data => {
                let stream_id = frame.stream_id;
                let receiver_gone = match self.streams.get(&stream_id) {
                    Some(data_tx) => data_tx.send(frame.payload).await.is_err(),
                    None => {
                        trace!(stream = stream_id, "data for unknown stream");
                        false
                    }
                };
                if receiver_gone {
                    // Consumer dropped its handle without closing; retire the
                    // stream and tell the peer
                    self.remove_stream(stream_id);
                    self.writer
                        .write_frame(&Frame::close(stream_id).encode())
                        .await?;
                }
                Ok(())
            }
            FrameType::Close => {
                self.remove_stream(frame.stream_id);
                Ok(())
            }
            FrameType::Open => {
                // The relay side opens all streams; a peer-initiated open is
                // out of protocol and dropped
                trace!(stream = frame.stream_id, "ignoring peer-initiated open");
                Ok(())
            }
            FrameType::GoAway => Err(MuxError::SessionClosed),
        }
    }

    async fn handle_cmd(&mut self, cmd: MuxCmd) -> Result<(), MuxError> {
        match cmd {
            MuxCmd::Open { destination, reply } => {
                let stream_id = self.next_stream_id;
                self.next_stream_id = self.next_stream_id.wrapping_add(2);

                if let Err(e) = self
                    .writer
                    .write_frame(&Frame::open(stream_id, destination.as_bytes()).encode())
                    .await
                {
                    let _ = reply.send(Err(MuxError::SessionClosed));
                    return Err(e.into());
                }

                let (data_tx, data_rx) = mpsc::channel(self.data_channel_cap);
                self.streams.insert(stream_id, data_tx);
                self.update_count();

                let stream = MuxStream::new(stream_id, self.cmd_tx.clone(), data_rx);
                if reply.send(Ok(stream)).is_err() {
                    // Caller vanished before taking delivery; retire the stream
                    self.remove_stream(stream_id);
                    let _ = self
                        .writer
                        .write_frame(&Frame::close(stream_id).encode())
                        .await;
                }
                Ok(())
            }
            MuxCmd::Data { stream_id, data } => {
                if !self.streams.contains_key(&stream_id) {
                    // Stream already retired (peer closed); drop silently
                    return Ok(());
                }
                let mut offset = 0;
                while offset < data.len() {
                    let end = (offset + MAX_DATA_LEN).min(data.len());
                    self.writer
                        .write_frame(&Frame::data(stream_id, data.slice(offset..end)).encode())
                        .await?;
                    offset = end;
                }
                Ok(())
            }
            MuxCmd::CloseStream { stream_id } => {
                if self.streams.remove(&stream_id).is_some() {
                    self.update_count();
                    self.writer
                        .write_frame(&Frame::close(stream_id).encode())
                        .await?;
                }
                Ok(())
            }
        }
    }

    fn remove_stream(&mut self, stream_id: u32) {
        if self.streams.remove(&stream_id).is_some() {
            self.update_count();
        }
    }

    fn update_count(&self) {
        self.stream_count.store(self.streams.len(), Ordering::Relaxed);
    }

    async fn finish(mut self) {
        self.closed.signal();
        let _ = self.writer.write_frame(&Frame::go_away().encode()).await;
        // Dropping the senders delivers end-of-stream to every consumer
        self.streams.clear();
        self.stream_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

    type PeerReader = FrameReader<ReadHalf<DuplexStream>>;
    type PeerWriter = FrameWriter<WriteHalf<DuplexStream>>;

    /// Session plus a hand-driven peer endpoint
    fn session_pair() -> (Arc<MuxSession>, PeerReader, PeerWriter) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (near_read, near_write) = split(near);
        let (far_read, far_write) = split(far);

        let session = MuxSession::client(
            FrameReader::plain(near_read),
            FrameWriter::plain(near_write),
            MuxConfig::default(),
        );
        (
            session,
            FrameReader::plain(far_read),
            FrameWriter::plain(far_write),
        )
    }

    async fn read_mux_frame(reader: &mut PeerReader) -> Frame {
        Frame::decode(reader.read_frame().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_open_stream_sends_open_frame() {
        let (session, mut peer_rx, _peer_tx) = session_pair();

        let stream = session.open_stream("127.0.0.1:22").await.unwrap();
        assert_eq!(stream.id(), 1);
        assert_eq!(session.num_streams(), 1);

        let frame = read_mux_frame(&mut peer_rx).await;
        assert_eq!(frame.frame_type, FrameType::Open);
        assert_eq!(frame.stream_id, 1);
        assert_eq!(&frame.payload[..], b"127.0.0.1:22");
    }

    #[tokio::test]
    async fn test_stream_ids_are_odd() {
        let (session, mut peer_rx, _peer_tx) = session_pair();

        let s1 = session.open_stream("a:1").await.unwrap();
        let s2 = session.open_stream("a:1").await.unwrap();
        let s3 = session.open_stream("a:1").await.unwrap();
        assert_eq!((s1.id(), s2.id(), s3.id()), (1, 3, 5));
        assert_eq!(session.num_streams(), 3);

        for _ in 0..3 {
            read_mux_frame(&mut peer_rx).await;
        }
    }

    #[tokio::test]
    async fn test_data_both_directions() {
        let (session, mut peer_rx, mut peer_tx) = session_pair();

        let mut stream = session.open_stream("svc:80").await.unwrap();
        let open = read_mux_frame(&mut peer_rx).await;

        // Relay -> peer
        stream.write(Bytes::from_static(b"request")).await.unwrap();
        let frame = read_mux_frame(&mut peer_rx).await;
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(frame.stream_id, open.stream_id);
        assert_eq!(&frame.payload[..], b"request");

        // Peer -> relay
        peer_tx
            .write_frame(&Frame::data(open.stream_id, Bytes::from_static(b"response")).encode())
            .await
            .unwrap();
        assert_eq!(&stream.read().await.unwrap()[..], b"response");
    }

    #[tokio::test]
    async fn test_local_close_retires_stream() {
        let (session, mut peer_rx, _peer_tx) = session_pair();

        let stream = session.open_stream("svc:80").await.unwrap();
        read_mux_frame(&mut peer_rx).await;

        stream.close().await;
        let frame = read_mux_frame(&mut peer_rx).await;
        assert_eq!(frame.frame_type, FrameType::Close);

        // Count observed by the pool drops back to zero
        tokio::task::yield_now().await;
        assert_eq!(session.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_delivers_eof() {
        let (session, mut peer_rx, mut peer_tx) = session_pair();

        let mut stream = session.open_stream("svc:80").await.unwrap();
        let open = read_mux_frame(&mut peer_rx).await;

        peer_tx
            .write_frame(&Frame::close(open.stream_id).encode())
            .await
            .unwrap();

        assert!(stream.read().await.is_none());
        assert_eq!(session.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_go_away_closes_session() {
        let (session, mut _peer_rx, mut peer_tx) = session_pair();

        peer_tx
            .write_frame(&Frame::go_away().encode())
            .await
            .unwrap();

        session.closed.wait().await;
        assert!(session.is_closed());
        assert!(session.open_stream("svc:80").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _peer_rx, _peer_tx) = session_pair();
        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(session.num_streams(), 0);
    }
}
