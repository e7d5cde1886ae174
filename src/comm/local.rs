//! In-process grid: every rank is a tokio task inside one process.
//!
//! This is the substrate the tests and the demo binary run on. Collective
//! payloads travel over one unbounded channel per rank; arrivals from fast
//! peers are stashed per source so that two consecutive collectives can
//! never interleave. Point-to-point messages land in a per-rank mailbox
//! keyed by `(source, tag)` with FIFO queues, which gives the same
//! non-overtaking guarantee MPI does for matching sends.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot, Barrier, Mutex as AsyncMutex};
use tracing::trace;

use super::{Communicator, Rank, RecvTicket, SendTicket, Tag};
use crate::error::Error;

struct CollectiveInbox {
    rx: mpsc::UnboundedReceiver<(Rank, Vec<u8>)>,
    /// arrivals from other sources than the one currently awaited
    stashed: HashMap<Rank, VecDeque<Vec<u8>>>,
}

#[derive(Default)]
struct Mailbox {
    queued: HashMap<(Rank, Tag), VecDeque<Vec<u8>>>,
    waiting: HashMap<(Rank, Tag), VecDeque<oneshot::Sender<Result<Vec<u8>, Error>>>>,
}

struct Node {
    coll_tx: mpsc::UnboundedSender<(Rank, Vec<u8>)>,
    coll: AsyncMutex<CollectiveInbox>,
    mail: Mutex<Mailbox>,
}

struct GridCore {
    size: u32,
    barrier: Barrier,
    nodes: Vec<Node>,
}

/// One rank's handle onto an in-process grid.
pub struct LocalGrid {
    rank: Rank,
    core: Arc<GridCore>,
}

impl LocalGrid {
    /// Builds a grid of `size` ranks and returns one handle per rank, in
    /// rank order.
    pub fn create(size: u32) -> Vec<LocalGrid> {
        let nodes = (0..size)
            .map(|_| {
                let (coll_tx, rx) = mpsc::unbounded_channel();
                Node {
                    coll_tx,
                    coll: AsyncMutex::new(CollectiveInbox {
                        rx,
                        stashed: HashMap::new(),
                    }),
                    mail: Mutex::new(Mailbox::default()),
                }
            })
            .collect();
        let core = Arc::new(GridCore {
            size,
            barrier: Barrier::new(size as usize),
            nodes,
        });
        (0..size)
            .map(|rank| LocalGrid {
                rank,
                core: core.clone(),
            })
            .collect()
    }

    fn coll_send_to(&self, dest: Rank, payload: Vec<u8>) -> Result<(), Error> {
        self.core.nodes[dest as usize]
            .coll_tx
            .send((self.rank, payload))
            .map_err(|_| Error::ChannelClosed("collective inbox"))
    }

    async fn coll_recv_from(&self, source: Rank) -> Result<Vec<u8>, Error> {
        let mut inbox = self.core.nodes[self.rank as usize].coll.lock().await;
        if let Some(queue) = inbox.stashed.get_mut(&source) {
            if let Some(payload) = queue.pop_front() {
                return Ok(payload);
            }
        }
        loop {
            let (from, payload) = inbox
                .rx
                .recv()
                .await
                .ok_or(Error::ChannelClosed("collective inbox"))?;
            if from == source {
                return Ok(payload);
            }
            inbox.stashed.entry(from).or_default().push_back(payload);
        }
    }
}

impl Communicator for LocalGrid {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.core.size
    }

    async fn broadcast(&self, root: Rank, payload: Option<Vec<u8>>) -> Result<Vec<u8>, Error> {
        if self.rank == root {
            let payload =
                payload.ok_or(Error::InvalidCollective("broadcast root needs a payload"))?;
            for rank in 0..self.core.size {
                if rank != root {
                    self.coll_send_to(rank, payload.clone())?;
                }
            }
            Ok(payload)
        } else {
            self.coll_recv_from(root).await
        }
    }

    async fn scatter(&self, root: Rank, parts: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>, Error> {
        if self.rank == root {
            let mut parts =
                parts.ok_or(Error::InvalidCollective("scatter root needs the parts"))?;
            if parts.len() != self.core.size as usize {
                return Err(Error::InvalidCollective("scatter needs one part per rank"));
            }
            let mut own = None;
            for rank in (0..self.core.size).rev() {
                let part = parts.pop().ok_or(Error::InvalidCollective("scatter part"))?;
                if rank == root {
                    own = Some(part);
                } else {
                    self.coll_send_to(rank, part)?;
                }
            }
            own.ok_or(Error::InvalidCollective("scatter root part missing"))
        } else {
            self.coll_recv_from(root).await
        }
    }

    async fn gather(&self, root: Rank, part: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, Error> {
        if self.rank == root {
            let mut out: Vec<Vec<u8>> = Vec::with_capacity(self.core.size as usize);
            for rank in 0..self.core.size {
                if rank == root {
                    out.push(part.clone());
                } else {
                    out.push(self.coll_recv_from(rank).await?);
                }
            }
            Ok(Some(out))
        } else {
            self.coll_send_to(root, part)?;
            Ok(None)
        }
    }

    async fn barrier(&self) -> Result<(), Error> {
        self.core.barrier.wait().await;
        Ok(())
    }

    fn isend(&self, payload: Vec<u8>, dest: Rank, tag: Tag) -> Result<SendTicket, Error> {
        trace!(from = self.rank, to = dest, tag, len = payload.len(), "isend");
        let mut mail = self.core.nodes[dest as usize]
            .mail
            .lock()
            .map_err(|_| Error::ChannelClosed("mailbox"))?;
        if let Some(waiters) = mail.waiting.get_mut(&(self.rank, tag)) {
            if let Some(waiter) = waiters.pop_front() {
                // a receive was already posted; hand the payload straight over
                let _ = waiter.send(Ok(payload));
                return Ok(SendTicket::completed());
            }
        }
        mail.queued
            .entry((self.rank, tag))
            .or_default()
            .push_back(payload);
        Ok(SendTicket::completed())
    }

    fn irecv(&self, source: Rank, tag: Tag) -> Result<RecvTicket, Error> {
        trace!(at = self.rank, from = source, tag, "irecv");
        let mut mail = self.core.nodes[self.rank as usize]
            .mail
            .lock()
            .map_err(|_| Error::ChannelClosed("mailbox"))?;
        if let Some(queue) = mail.queued.get_mut(&(source, tag)) {
            if let Some(payload) = queue.pop_front() {
                return Ok(RecvTicket::ready(payload));
            }
        }
        let (tx, rx) = oneshot::channel();
        mail.waiting
            .entry((source, tag))
            .or_default()
            .push_back(tx);
        Ok(RecvTicket::pending(rx))
    }
}
