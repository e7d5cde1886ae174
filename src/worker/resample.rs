//! The resample protocol: one round of discarding, replicating and
//! redistributing particles according to an externally computed plan.
//!
//! The round is a fixed ten-step sequence. Everything before the barrier
//! only issues non-blocking transfers and serializes state; everything after
//! it mutates the local table. The barrier is the single global ordering
//! point between the two phases: once every rank has passed it, no buffer
//! referenced by an in-flight transfer can be touched by table mutation.
//! There is deliberately no finer-grained locking than that.

use std::time::Instant;

use futures::future::try_join_all;
use hashbrown::HashMap;
use tracing::{debug, debug_span, trace, Instrument};

use crate::comm::{Communicator, Rank, RecvTicket, SendTicket};
use crate::ensemble::{Ensemble, Task};
use crate::error::Error;
use crate::wire::{
    pack_state, parse_state_header, unpack_state, ParticleIndex, RoutingEntry,
};

/// What one round did, and how long it took.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundTiming {
    pub elapsed_micros: u64,
    /// transfers issued, one per (index, destination) pair
    pub sent: u64,
    /// replicas materialized from remote arrivals
    pub received: u64,
    /// particles garbage-collected because no entry selected them
    pub dropped: u64,
    /// extra local replicas cloned from stashed state
    pub replicated: u64,
}

struct PendingSend {
    len_ticket: SendTicket,
    data_ticket: SendTicket,
}

impl PendingSend {
    async fn drain(self) -> Result<(), Error> {
        self.len_ticket.wait().await?;
        self.data_ticket.wait().await
    }
}

struct PendingRecv {
    source: Rank,
    index: ParticleIndex,
    reindexes: Vec<ParticleIndex>,
    len_ticket: RecvTicket,
}

fn claim_slot<T>(
    next: &mut HashMap<ParticleIndex, T>,
    reindex: ParticleIndex,
    task: T,
    rank: Rank,
) -> Result<(), Error> {
    if next.insert(reindex, task).is_some() {
        return Err(Error::SlotCollision { rank, reindex });
    }
    Ok(())
}

/// Runs one resample round. The ensemble is mutated in place; on return it
/// holds exactly the post-resample population and every outgoing transfer
/// has fully drained, so rounds can never overlap.
pub async fn resample<T: Task, C: Communicator>(
    ensemble: &mut Ensemble<T>,
    plan: &[RoutingEntry],
    comm: &C,
) -> Result<RoundTiming, Error> {
    let me = ensemble.address();
    let span = debug_span!("resample", rank = me);
    async move {
        let started = Instant::now();

        // Step 0: the plan must agree with the local population before any
        // transfer is issued.
        for entry in plan {
            if entry.source == me && !ensemble.contains(entry.index) {
                return Err(Error::MissingParticle {
                    rank: me,
                    index: entry.index,
                });
            }
        }

        // Step 1: classify this rank's entries.
        let mut keep: HashMap<ParticleIndex, Vec<ParticleIndex>> = HashMap::new();
        let mut send: HashMap<ParticleIndex, HashMap<Rank, u64>> = HashMap::new();
        let mut recv: HashMap<(Rank, ParticleIndex), Vec<ParticleIndex>> = HashMap::new();
        for entry in plan {
            if entry.source == me {
                if entry.destination == me {
                    keep.entry(entry.index).or_default().push(entry.reindex);
                } else {
                    *send
                        .entry(entry.index)
                        .or_default()
                        .entry(entry.destination)
                        .or_insert(0) += 1;
                }
            } else if entry.destination == me {
                recv.entry((entry.source, entry.index))
                    .or_default()
                    .push(entry.reindex);
            }
        }

        // Step 2: particles selected by nobody simply vanish.
        let dropped =
            ensemble.retain_indices(|index| keep.contains_key(&index) || send.contains_key(&index));
        if dropped > 0 {
            debug!(dropped, "released unselected particles");
        }

        // Step 3: two-phase exchange, tagged by particle index. Each
        // outgoing particle is serialized exactly once; the length leg goes
        // first so the receiver knows what to expect, and FIFO-per-tag
        // delivery keeps the legs paired.
        let mut blobs: HashMap<ParticleIndex, Vec<u8>> = HashMap::new();
        let mut sends = Vec::new();
        let mut sent = 0u64;
        let mut outgoing: Vec<ParticleIndex> = send.keys().copied().collect();
        outgoing.sort_unstable();
        for index in outgoing {
            let raw = ensemble.save_particle(index)?;
            let (header, wire) = pack_state(&raw)?;
            let mut dests: Vec<(Rank, u64)> =
                send[&index].iter().map(|(&d, &c)| (d, c)).collect();
            dests.sort_unstable();
            for (dest, copies) in dests {
                trace!(index, dest, copies, "routing particle out");
                let len_ticket = comm.isend(header.clone(), dest, index)?;
                let data_ticket = comm.isend(wire.clone(), dest, index)?;
                sends.push(PendingSend {
                    len_ticket,
                    data_ticket,
                });
                sent += 1;
            }
            blobs.insert(index, raw);
        }
        let mut recvs = Vec::new();
        for (&(source, index), reindexes) in &recv {
            let len_ticket = comm.irecv(source, index)?;
            recvs.push(PendingRecv {
                source,
                index,
                reindexes: reindexes.clone(),
                len_ticket,
            });
        }

        // Step 4: a sent-only particle's bytes are already captured; the
        // live object can go before the heavier cloning below.
        ensemble.retain_indices(|index| keep.contains_key(&index));

        // Step 5: stash every kept particle's state so its live slot can be
        // reused. Bytes serialized for sending are reused as-is.
        let mut stash: HashMap<ParticleIndex, Vec<u8>> = HashMap::new();
        for &index in keep.keys() {
            let bytes = match blobs.remove(&index) {
                Some(bytes) => bytes,
                None => ensemble.save_particle(index)?,
            };
            stash.insert(index, bytes);
        }
        drop(blobs);

        // Step 6: the one global ordering point. After this, every rank has
        // issued its transfers for the round and table mutation is safe.
        comm.barrier().await?;

        // Steps 7 and 8: rebuild the local table. The first reindex of a
        // kept particle reuses the live replica; every further one is a
        // fresh clone loaded from the stash.
        let mut next: HashMap<ParticleIndex, T> = HashMap::new();
        let mut replicated = 0u64;
        for (&index, reindexes) in &keep {
            let Some((&first, rest)) = reindexes.split_first() else {
                continue;
            };
            let bytes = &stash[&index];
            let live = ensemble
                .take(index)
                .ok_or(Error::MissingParticle { rank: me, index })?;
            claim_slot(&mut next, first, live, me)?;
            for &reindex in rest {
                let mut replica = ensemble.template().clone();
                replica.load(bytes)?;
                claim_slot(&mut next, reindex, replica, me)?;
                replicated += 1;
            }
        }

        // Step 9: materialize remote arrivals, fanning each one out to every
        // slot its tag requested.
        let mut received = 0u64;
        for pending in recvs {
            let header = pending.len_ticket.wait().await?;
            let (raw_len, wire_len) = parse_state_header(&header)?;
            let wire = comm.irecv(pending.source, pending.index)?.wait().await?;
            if wire.len() as u64 != wire_len {
                return Err(Error::MalformedStateFrame);
            }
            let raw = unpack_state(raw_len, wire)?;
            trace!(
                index = pending.index,
                from = pending.source,
                slots = pending.reindexes.len(),
                "materializing arrival"
            );
            for &reindex in &pending.reindexes {
                let mut replica = ensemble.template().clone();
                replica.load(&raw)?;
                claim_slot(&mut next, reindex, replica, me)?;
                received += 1;
            }
        }
        ensemble.replace(next);

        // Step 10: no send buffer outlives the round.
        try_join_all(sends.into_iter().map(PendingSend::drain)).await?;

        let timing = RoundTiming {
            elapsed_micros: started.elapsed().as_micros() as u64,
            sent,
            received,
            dropped,
            replicated,
        };
        debug!(
            sent,
            received,
            dropped,
            replicated,
            micros = timing.elapsed_micros,
            population = ensemble.len(),
            "round complete"
        );
        Ok(timing)
    }
    .instrument(span)
    .await
}
