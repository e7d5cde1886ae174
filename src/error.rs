use std::io;

use core::fmt;

use crate::comm::Rank;
use crate::wire::{Opcode, ParticleIndex};

/// Every failure in this crate is fatal to the whole distributed run: the
/// protocol's correctness depends on a globally consistent routing plan and a
/// fully synchronous round structure, so there is no per-rank recovery path.
/// Errors propagate out of the worker/manager loops and the hosting process
/// tears the computation down.
#[derive(Debug)]
pub enum Error {
    /// A routing entry names `source == self` but the particle is not in the
    /// local ensemble: the plan and the population have diverged.
    MissingParticle { rank: Rank, index: ParticleIndex },
    /// Two particles were routed into the same local slot on this rank.
    SlotCollision { rank: Rank, reindex: ParticleIndex },
    /// An instruction arrived that is not legal in the worker's current
    /// state.
    UnexpectedInstruction {
        state: &'static str,
        opcode: Opcode,
    },
    /// A round instruction arrived before INIT built an ensemble.
    NoEnsemble,
    CouldNotEncodeMessage(&'static str),
    CouldNotDecodeMessage(&'static str),
    /// A state frame's header and payload disagree.
    MalformedStateFrame,
    MessageLengthOverflowed,
    /// A peer's inbox or a pending ticket was dropped mid-round.
    ChannelClosed(&'static str),
    /// A collective was called with arguments that don't match the grid
    /// (wrong part count, payload from a non-root, incomplete gather).
    InvalidCollective(&'static str),
    Io(io::Error),
    Task(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingParticle { rank, index } => write!(
                f,
                "rank {rank}: routing plan references particle {index} which is not held locally"
            ),
            Error::SlotCollision { rank, reindex } => {
                write!(f, "rank {rank}: two particles routed into local slot {reindex}")
            }
            Error::UnexpectedInstruction { state, opcode } => {
                write!(f, "instruction {opcode} is not valid in state {state}")
            }
            Error::NoEnsemble => write!(f, "round instruction received before INIT"),
            Error::CouldNotEncodeMessage(what) => write!(f, "could not encode {what}"),
            Error::CouldNotDecodeMessage(what) => write!(f, "could not decode {what}"),
            Error::MalformedStateFrame => write!(f, "state frame header does not match payload"),
            Error::MessageLengthOverflowed => write!(f, "message length overflowed"),
            Error::ChannelClosed(what) => write!(f, "{what} closed mid-round"),
            Error::InvalidCollective(what) => write!(f, "invalid collective: {what}"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Task(what) => write!(f, "task error: {what}"),
        }
    }
}

impl std::error::Error for Error {}
