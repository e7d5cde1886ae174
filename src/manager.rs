//! Manager-side round driver.
//!
//! The manager occupies rank 0 and is the root of every collective. Each
//! public method performs exactly the collective sequence the worker
//! contract expects for that instruction; the two sides must stay aligned or
//! the grid deadlocks at the next collective, which is the intended failure
//! mode for a desynchronized round structure.

use chrono::Utc;
use tracing::debug;

use crate::comm::{Communicator, Rank};
use crate::error::Error;
use crate::wire::{
    CallOp, IndexAssignment, Instruction, RankReport, RoutingEntry, RoutingSlice, SessionHello,
    MANAGER_RANK,
};

pub struct Manager<C: Communicator> {
    comm: C,
    session: u64,
}

impl<C: Communicator> Manager<C> {
    pub fn new(comm: C) -> Self {
        Self {
            comm,
            session: rand::random(),
        }
    }

    /// Worker count (every rank except the manager).
    pub fn workers(&self) -> u32 {
        self.comm.size() - 1
    }

    async fn instruct(&self, instruction: Instruction) -> Result<(), Error> {
        debug!(opcode = %instruction.opcode(), "broadcasting instruction");
        self.comm
            .broadcast(MANAGER_RANK, Some(instruction.encode()?))
            .await?;
        Ok(())
    }

    /// Announces the session so workers can leave CONNECTING. Call once,
    /// before the first instruction.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        let hello = SessionHello {
            session: self.session,
            sent_at_micros: Utc::now().timestamp_micros(),
        };
        debug!(session = self.session, workers = self.workers(), "bootstrap");
        self.comm
            .broadcast(MANAGER_RANK, Some(hello.encode()?))
            .await?;
        Ok(())
    }

    /// INIT: one index assignment per worker, in rank order.
    pub async fn init(&self, assignments: &[Vec<u64>]) -> Result<(), Error> {
        if assignments.len() != self.workers() as usize {
            return Err(Error::InvalidCollective("one assignment per worker"));
        }
        self.instruct(Instruction::Init).await?;
        let mut parts = Vec::with_capacity(self.comm.size() as usize);
        parts.push(Vec::new());
        for indices in assignments {
            parts.push(
                IndexAssignment {
                    indices: indices.clone(),
                }
                .encode()?,
            );
        }
        self.comm.scatter(MANAGER_RANK, Some(parts)).await?;
        self.comm.barrier().await
    }

    /// CALL: returns the per-worker replies (in rank order) iff `results`.
    pub async fn call(&self, op: CallOp, results: bool) -> Result<Option<Vec<Vec<u8>>>, Error> {
        self.instruct(Instruction::Call { op, results }).await?;
        self.comm.barrier().await?;
        if !results {
            return Ok(None);
        }
        let all = self
            .comm
            .gather(MANAGER_RANK, Vec::new())
            .await?
            .ok_or(Error::InvalidCollective("gather root got no parts"))?;
        Ok(Some(all.into_iter().skip(1).collect()))
    }

    /// RESA: scatters each rank's slice of the plan and sits through both
    /// barriers of the round (the protocol's own barrier, then the round-end
    /// one).
    pub async fn resample(&self, plan: &[RoutingEntry]) -> Result<(), Error> {
        self.instruct(Instruction::Resample).await?;
        let mut parts = Vec::with_capacity(self.comm.size() as usize);
        for rank in 0..self.comm.size() {
            parts.push(slice_for(plan, rank).encode()?);
        }
        self.comm.scatter(MANAGER_RANK, Some(parts)).await?;
        self.comm.barrier().await?;
        self.comm.barrier().await
    }

    /// DONE: closes the session and collects the per-rank summaries, in rank
    /// order.
    pub async fn done(&self) -> Result<Vec<RankReport>, Error> {
        self.instruct(Instruction::Done).await?;
        let all = self
            .comm
            .gather(MANAGER_RANK, Vec::new())
            .await?
            .ok_or(Error::InvalidCollective("gather root got no parts"))?;
        all.iter().skip(1).map(|bytes| RankReport::decode(bytes)).collect()
    }

    /// EXIT: releases every worker; consumes the manager.
    pub async fn exit(self) -> Result<(), Error> {
        self.instruct(Instruction::Exit).await
    }
}

/// The slice of the plan a rank needs: every entry that names it as source
/// or destination.
fn slice_for(plan: &[RoutingEntry], rank: Rank) -> RoutingSlice {
    RoutingSlice {
        entries: plan
            .iter()
            .filter(|entry| entry.source == rank || entry.destination == rank)
            .copied()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, source: Rank, destination: Rank, reindex: u64) -> RoutingEntry {
        RoutingEntry {
            index,
            source,
            destination,
            reindex,
        }
    }

    #[test]
    fn slices_cover_sources_and_destinations() {
        let plan = vec![
            entry(0, 1, 1, 0),
            entry(0, 1, 2, 1),
            entry(5, 2, 1, 5),
        ];
        let for_manager = slice_for(&plan, 0);
        assert!(for_manager.entries.is_empty());
        let for_one = slice_for(&plan, 1);
        assert_eq!(for_one.entries.len(), 3);
        let for_two = slice_for(&plan, 2);
        assert_eq!(for_two.entries, vec![plan[1], plan[2]]);
    }
}
