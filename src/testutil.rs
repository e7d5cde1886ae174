//! Shared fixtures for the crate's tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::comm::{Communicator, Rank, RecvTicket, SendTicket, Tag};
use crate::ensemble::Task;
use crate::error::Error;
use crate::wire::ParticleIndex;

/// A task whose entire model state is one byte vector. `spawn_at` seeds the
/// state with the index's little-endian bytes, `step` appends one byte per
/// call, so content and history are both observable.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ByteTask {
    pub state: Vec<u8>,
}

impl ByteTask {
    pub fn with(state: &[u8]) -> Self {
        Self {
            state: state.to_vec(),
        }
    }
}

impl Task for ByteTask {
    fn save(&self) -> Result<Vec<u8>, Error> {
        Ok(self.state.clone())
    }

    fn load(&mut self, state: &[u8]) -> Result<(), Error> {
        self.state = state.to_vec();
        Ok(())
    }

    fn spawn_at(&mut self, index: ParticleIndex) {
        self.state = index.to_le_bytes().to_vec();
    }

    fn step(&mut self, count: u64) {
        self.state.push(count as u8);
    }

    fn set_params(&mut self, params: &[u8]) -> Result<(), Error> {
        self.state = params.to_vec();
        Ok(())
    }

    fn log_weight(&self) -> f64 {
        self.state.len() as f64
    }
}

/// A communicator that records how often it is touched and never moves any
/// data. Used to prove that validation fails before any network call.
#[derive(Default)]
pub(crate) struct CountingComm {
    pub sends: AtomicUsize,
    pub recvs: AtomicUsize,
    pub collectives: AtomicUsize,
}

impl CountingComm {
    pub fn untouched(&self) -> bool {
        self.sends.load(Ordering::SeqCst) == 0
            && self.recvs.load(Ordering::SeqCst) == 0
            && self.collectives.load(Ordering::SeqCst) == 0
    }
}

impl Communicator for CountingComm {
    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> u32 {
        1
    }

    async fn broadcast(&self, _root: Rank, payload: Option<Vec<u8>>) -> Result<Vec<u8>, Error> {
        self.collectives.fetch_add(1, Ordering::SeqCst);
        Ok(payload.unwrap_or_default())
    }

    async fn scatter(&self, _root: Rank, _parts: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>, Error> {
        self.collectives.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn gather(&self, _root: Rank, _part: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, Error> {
        self.collectives.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn barrier(&self) -> Result<(), Error> {
        self.collectives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn isend(&self, _payload: Vec<u8>, _dest: Rank, _tag: Tag) -> Result<SendTicket, Error> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(SendTicket::completed())
    }

    fn irecv(&self, _source: Rank, _tag: Tag) -> Result<RecvTicket, Error> {
        self.recvs.fetch_add(1, Ordering::SeqCst);
        Ok(RecvTicket::ready(Vec::new()))
    }
}
