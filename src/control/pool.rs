//! Pipe pool and its manager task
//!
//! The manager is the only task that touches the idle/busy collections;
//! producers and consumers reach it through channels. It holds at most one
//! `available` session ready for hand-off at any time.

use super::{Control, CLEAN_INTERVAL, MAX_IDLE_PIPES, MAX_STREAMS, PIPE_REQ_TIMEOUT};
use crate::msg::Msg;
use crate::mux::MuxSession;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Reply slot enqueued by one `get_pipe` call
pub(crate) type PipeWaiter = oneshot::Sender<Arc<MuxSession>>;

/// Idle/busy session collections
///
/// A session lives in at most one collection; while handed to a consumer it
/// is in neither.
struct PipePool {
    idle: VecDeque<Arc<MuxSession>>,
    busy: Vec<Arc<MuxSession>>,
}

impl PipePool {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            busy: Vec::new(),
        }
    }

    fn idle_count(&self) -> usize {
        self.idle.len()
    }

    fn push_idle(&mut self, pipe: Arc<MuxSession>) {
        self.idle.push_back(pipe);
    }

    fn push_busy(&mut self, pipe: Arc<MuxSession>) {
        self.busy.push(pipe);
    }

    /// Unlink and return the first live idle session, dropping dead ones
    fn pop_idle(&mut self) -> Option<Arc<MuxSession>> {
        while let Some(pipe) = self.idle.pop_front() {
            if !pipe.is_closed() {
                return Some(pipe);
            }
        }
        None
    }

    /// Pool maintenance
    ///
    /// Busy sessions whose streams drained move back to idle; dead sessions
    /// are dropped from both collections; zero-stream idle sessions beyond
    /// the cap are closed.
    fn clean(&mut self) {
        let busy = std::mem::take(&mut self.busy);
        for pipe in busy {
            if pipe.is_closed() {
                continue;
            }
            if pipe.num_streams() < MAX_STREAMS {
                self.idle.push_back(pipe);
            } else {
                self.busy.push(pipe);
            }
        }

        self.idle.retain(|pipe| !pipe.is_closed());

        let mut i = 0;
        while self.idle.len() > MAX_IDLE_PIPES && i < self.idle.len() {
            if self.idle[i].num_streams() == 0 {
                if let Some(surplus) = self.idle.remove(i) {
                    debug!("closing surplus idle pipe");
                    surplus.close();
                }
            } else {
                i += 1;
            }
        }
    }

    /// Close everything still pooled
    fn close_all(&mut self) {
        for pipe in self.idle.drain(..).chain(self.busy.drain(..)) {
            pipe.close();
        }
    }
}

/// Pipe manager task
///
/// *Prepare*: find a dispatchable session, soliciting the client with
/// `PIPE_REQ` when the pool is empty. *Available*: hand the session to the
/// next waiter while absorbing new arrivals and periodic cleaning. Exits on
/// death, closing every session it still owns.
pub(crate) async fn pipe_manager(
    ctl: Arc<Control>,
    mut pipe_in: mpsc::Receiver<Arc<MuxSession>>,
    mut waiters: mpsc::Receiver<PipeWaiter>,
) {
    let mut pool = PipePool::new();
    let mut clean_tick = interval_at(Instant::now() + CLEAN_INTERVAL, CLEAN_INTERVAL);
    clean_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut available: Option<Arc<MuxSession>> = None;

    'main: loop {
        'prepare: while available.as_ref().map_or(true, |pipe| pipe.is_closed()) {
            available = pool.pop_idle();
            if available.is_some() {
                break 'prepare;
            }
            pool.clean();
            available = pool.pop_idle();
            if available.is_some() {
                break 'prepare;
            }

            // Supply exhausted: ask the client for a fresh pipe
            tokio::select! {
                res = ctl.write_tx.send(Msg::PipeReq) => {
                    if res.is_err() {
                        break 'main;
                    }
                }
                _ = ctl.die.wait() => break 'main,
            }

            let retry = sleep(PIPE_REQ_TIMEOUT);
            tokio::pin!(retry);
            loop {
                tokio::select! {
                    _ = clean_tick.tick() => {
                        pool.clean();
                        if let Some(pipe) = pool.pop_idle() {
                            available = Some(pipe);
                            break 'prepare;
                        }
                    }
                    pipe = pipe_in.recv() => match pipe {
                        Some(pipe) if !pipe.is_closed() => {
                            if pipe.num_streams() < MAX_STREAMS {
                                available = Some(pipe);
                                break 'prepare;
                            }
                            pool.push_busy(pipe);
                        }
                        Some(_) => {}
                        None => break 'main,
                    },
                    _ = &mut retry => {
                        trace!(client_id = %ctl.client_id, "pipe request unanswered, asking again");
                        continue 'prepare;
                    }
                    _ = ctl.die.wait() => break 'main,
                }
            }
        }

        tokio::select! {
            _ = clean_tick.tick() => pool.clean(),
            waiter = waiters.recv() => match waiter {
                Some(reply) => {
                    if let Some(pipe) = available.take() {
                        trace!(client_id = %ctl.client_id, "dispatching pipe to consumer");
                        if let Err(pipe) = reply.send(pipe) {
                            // Consumer gave up in the meantime; keep the
                            // session on hand
                            available = Some(pipe);
                        }
                    }
                }
                None => break 'main,
            },
            pipe = pipe_in.recv() => match pipe {
                Some(pipe) if !pipe.is_closed() => {
                    if pipe.num_streams() < MAX_STREAMS {
                        pool.push_idle(pipe);
                    } else {
                        pool.push_busy(pipe);
                    }
                }
                Some(_) => {}
                None => break 'main,
            },
            _ = ctl.die.wait() => break 'main,
        }
    }

    // Teardown: nothing may survive in the pool after death
    if let Some(pipe) = available.take() {
        pipe.close();
    }
    pool.close_all();
    pipe_in.close();
    while let Ok(pipe) = pipe_in.try_recv() {
        pipe.close();
    }
    trace!(client_id = %ctl.client_id, "pipe manager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MuxConfig, MuxStream};
    use crate::transport::{FrameReader, FrameWriter};
    use tokio::io::split;

    /// Session whose peer end is discarded; frames it writes vanish into
    /// the duplex buffer
    fn detached_session() -> Arc<MuxSession> {
        let (near, far) = tokio::io::duplex(1024 * 1024);
        let (read, write) = split(near);
        std::mem::forget(far);
        MuxSession::client(
            FrameReader::plain(read),
            FrameWriter::plain(write),
            MuxConfig::default(),
        )
    }

    async fn open_streams(session: &Arc<MuxSession>, n: usize) -> Vec<MuxStream> {
        let mut streams = Vec::with_capacity(n);
        for _ in 0..n {
            streams.push(session.open_stream("svc:1").await.unwrap());
        }
        streams
    }

    #[tokio::test]
    async fn test_pop_idle_skips_dead_sessions() {
        let mut pool = PipePool::new();
        let dead = detached_session();
        dead.close();
        let live = detached_session();
        pool.push_idle(dead);
        pool.push_idle(Arc::clone(&live));

        let popped = pool.pop_idle().unwrap();
        assert!(Arc::ptr_eq(&popped, &live));
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.pop_idle().is_none());
    }

    #[tokio::test]
    async fn test_clean_promotes_drained_busy() {
        let mut pool = PipePool::new();
        let session = detached_session();
        let streams = open_streams(&session, MAX_STREAMS).await;
        assert_eq!(session.num_streams(), MAX_STREAMS);
        pool.push_busy(Arc::clone(&session));

        // Saturated: stays busy
        pool.clean();
        assert_eq!(pool.idle_count(), 0);

        // Drain one stream; the session becomes idle again
        streams[0].close().await;
        tokio::task::yield_now().await;
        assert_eq!(session.num_streams(), MAX_STREAMS - 1);

        pool.clean();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_clean_drops_dead_everywhere() {
        let mut pool = PipePool::new();
        let dead_idle = detached_session();
        dead_idle.close();
        let dead_busy = detached_session();
        dead_busy.close();
        pool.push_idle(dead_idle);
        pool.push_busy(dead_busy);

        pool.clean();
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.busy.is_empty());
    }

    #[tokio::test]
    async fn test_clean_evicts_surplus_zero_stream_idle() {
        let mut pool = PipePool::new();
        let sessions: Vec<_> = (0..MAX_IDLE_PIPES + 2).map(|_| detached_session()).collect();
        for session in &sessions {
            pool.push_idle(Arc::clone(session));
        }

        pool.clean();
        assert_eq!(pool.idle_count(), MAX_IDLE_PIPES);
        assert_eq!(
            sessions.iter().filter(|s| s.is_closed()).count(),
            2,
            "surplus sessions must be closed, not leaked"
        );
    }

    #[tokio::test]
    async fn test_clean_keeps_occupied_sessions_over_cap() {
        let mut pool = PipePool::new();
        let mut keepers = Vec::new();
        for _ in 0..MAX_IDLE_PIPES + 2 {
            let session = detached_session();
            keepers.push(open_streams(&session, 1).await);
            pool.push_idle(session);
        }

        // All sessions have a live stream, so none qualify for eviction
        pool.clean();
        assert_eq!(pool.idle_count(), MAX_IDLE_PIPES + 2);
    }

    #[tokio::test]
    async fn test_close_all() {
        let mut pool = PipePool::new();
        let a = detached_session();
        let b = detached_session();
        pool.push_idle(Arc::clone(&a));
        pool.push_busy(Arc::clone(&b));

        pool.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(pool.idle_count(), 0);
    }
}
