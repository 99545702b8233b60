//! Stream handles for multiplexed sessions

use super::session::MuxCmd;
use super::MuxError;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A bidirectional stream within a session
///
/// Owns both directions; [`MuxStream::into_split`] separates them so each
/// splice direction can run in its own task.
pub struct MuxStream {
    stream_id: u32,
    cmd_tx: mpsc::Sender<MuxCmd>,
    data_rx: mpsc::Receiver<Bytes>,
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: u32,
        cmd_tx: mpsc::Sender<MuxCmd>,
        data_rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            stream_id,
            cmd_tx,
            data_rx,
        }
    }

    /// Stream ID within the owning session
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Send data to the far side
    pub async fn write(&self, data: Bytes) -> Result<(), MuxError> {
        self.cmd_tx
            .send(MuxCmd::Data {
                stream_id: self.stream_id,
                data,
            })
            .await
            .map_err(|_| MuxError::SessionClosed)
    }

    /// Receive data from the far side; `None` means end-of-stream
    pub async fn read(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }

    /// Close the stream. Best-effort; the session may already be gone.
    pub async fn close(&self) {
        let _ = self
            .cmd_tx
            .send(MuxCmd::CloseStream {
                stream_id: self.stream_id,
            })
            .await;
    }

    /// Split into independently owned send and receive halves
    pub fn into_split(self) -> (MuxStreamWriter, MuxStreamReader) {
        (
            MuxStreamWriter {
                stream_id: self.stream_id,
                cmd_tx: self.cmd_tx,
            },
            MuxStreamReader {
                data_rx: self.data_rx,
            },
        )
    }
}

/// Send half of a stream
#[derive(Clone)]
pub struct MuxStreamWriter {
    stream_id: u32,
    cmd_tx: mpsc::Sender<MuxCmd>,
}

impl MuxStreamWriter {
    /// Stream ID within the owning session
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Send data to the far side
    pub async fn write(&self, data: Bytes) -> Result<(), MuxError> {
        self.cmd_tx
            .send(MuxCmd::Data {
                stream_id: self.stream_id,
                data,
            })
            .await
            .map_err(|_| MuxError::SessionClosed)
    }

    /// Close the stream. Best-effort.
    pub async fn close(&self) {
        let _ = self
            .cmd_tx
            .send(MuxCmd::CloseStream {
                stream_id: self.stream_id,
            })
            .await;
    }
}

/// Receive half of a stream
pub struct MuxStreamReader {
    data_rx: mpsc::Receiver<Bytes>,
}

impl MuxStreamReader {
    /// Receive data from the far side; `None` means end-of-stream
    pub async fn read(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }
}
