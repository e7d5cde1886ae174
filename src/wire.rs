//! Control-plane and routing value types, plus the framing used for particle
//! state blobs in transit.
//!
//! Every message the manager and workers exchange is an rkyv-encoded value
//! produced by one of the types here; the communicator only ever sees bytes.
//! Particle state travels as a two-leg frame: a fixed 16-byte header carrying
//! the raw and wire lengths, followed by the payload itself, zstd-compressed
//! when it is large enough to be worth it.

use byteorder::{ByteOrder, LittleEndian};
use core::fmt;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::comm::Rank;
use crate::error::Error;

/// A particle's local slot number. Unique within its owning ensemble at any
/// point in time; also used as the wire tag for that particle's transfers.
pub type ParticleIndex = u64;

/// The manager occupies rank 0 of the grid; workers are ranks 1 and up.
pub const MANAGER_RANK: Rank = 0;

/// State blobs longer than this go through zstd before hitting the wire.
const COMPRESS_THRESHOLD: usize = 4 * 1024;

/// raw_len | wire_len, both little-endian u64
pub const STATE_FRAME_LEN: usize = 16;

macro_rules! wire_codec {
    ($ty:ty, $name:literal) => {
        impl $ty {
            pub fn encode(&self) -> Result<Vec<u8>, Error> {
                rkyv::to_bytes::<_, 256>(self)
                    .map(|bytes| bytes.to_vec())
                    .map_err(|_| Error::CouldNotEncodeMessage($name))
            }

            pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
                // realign: the bytes usually arrive inside a plain Vec<u8>
                let mut aligned = AlignedVec::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                rkyv::from_bytes::<Self>(&aligned)
                    .map_err(|_| Error::CouldNotDecodeMessage($name))
            }
        }
    };
}

/// The closed set of operations a CALL round can invoke on every particle of
/// an ensemble. Dispatch is a typed match, resolved at compile time.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum CallOp {
    /// Advance every particle by `count` model steps.
    Step { count: u64 },
    /// Push an opaque parameter blob into every particle.
    SetParams(Vec<u8>),
    /// Collect `(index, log_weight)` for every particle, sorted by index.
    LogWeights,
    /// Collect the sorted local index population.
    Population,
}

/// One control-plane message, broadcast by the manager and consumed once by
/// every worker. INIT and RESA carry their per-rank data in a follow-up
/// scatter rather than in the broadcast itself.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum Instruction {
    Init,
    Call { op: CallOp, results: bool },
    Resample,
    Done,
    Exit,
}

wire_codec!(Instruction, "Instruction");

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Init => Opcode::Init,
            Instruction::Call { .. } => Opcode::Call,
            Instruction::Resample => Opcode::Resa,
            Instruction::Done => Opcode::Done,
            Instruction::Exit => Opcode::Exit,
        }
    }
}

/// Instruction discriminant, kept around for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Init,
    Call,
    Resa,
    Done,
    Exit,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Init => "INIT",
            Opcode::Call => "CALL",
            Opcode::Resa => "RESA",
            Opcode::Done => "DONE",
            Opcode::Exit => "EXIT",
        };
        write!(f, "{name}")
    }
}

/// Broadcast once at bootstrap so workers can bind to the session.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct SessionHello {
    pub session: u64,
    pub sent_at_micros: i64,
}

wire_codec!(SessionHello, "SessionHello");

/// Scatter payload for INIT: the particle indices this rank must spawn.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct IndexAssignment {
    pub indices: Vec<ParticleIndex>,
}

wire_codec!(IndexAssignment, "IndexAssignment");

/// A declaration that the particle currently at `index` on rank `source`
/// must, after this round, exist at local slot `reindex` on rank
/// `destination`. Read-only input to the resample protocol; duplicates over
/// `(index, source)` express replication, shared destinations fan-in.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RoutingEntry {
    pub index: ParticleIndex,
    pub source: Rank,
    pub destination: Rank,
    pub reindex: ParticleIndex,
}

/// Scatter payload for RESA: the entries of this round's plan that mention
/// the receiving rank as source or destination.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[archive(check_bytes)]
pub struct RoutingSlice {
    pub entries: Vec<RoutingEntry>,
}

wire_codec!(RoutingSlice, "RoutingSlice");

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct WeightEntry {
    pub index: ParticleIndex,
    pub log_weight: f64,
}

/// Gather payload for `CallOp::LogWeights`.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[archive(check_bytes)]
pub struct WeightReport {
    pub entries: Vec<WeightEntry>,
}

wire_codec!(WeightReport, "WeightReport");

/// Gather payload for `CallOp::Population`.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[archive(check_bytes)]
pub struct PopulationReport {
    pub indices: Vec<ParticleIndex>,
}

wire_codec!(PopulationReport, "PopulationReport");

/// Per-rank timing/summary record, gathered to the manager at DONE.
#[derive(Archive, Serialize, Deserialize, TypedBuilder, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct RankReport {
    pub rank: Rank,
    pub call_rounds: u64,
    pub resample_rounds: u64,
    pub resample_micros: u64,
    pub particles_sent: u64,
    pub particles_received: u64,
    pub particles_dropped: u64,
    pub particles_replicated: u64,
    pub population: u64,
    pub finished_at_micros: i64,
}

wire_codec!(RankReport, "RankReport");

/// Frames a particle state blob for the wire. Returns the 16-byte header and
/// the payload to send as the data leg.
pub fn pack_state(raw: &[u8]) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let wire = if raw.len() > COMPRESS_THRESHOLD {
        let compressed = zstd::bulk::compress(raw, 0)?;
        if compressed.len() < raw.len() {
            compressed
        } else {
            // incompressible; ship as-is
            raw.to_vec()
        }
    } else {
        raw.to_vec()
    };
    let mut header = vec![0u8; STATE_FRAME_LEN];
    LittleEndian::write_u64(&mut header[0..8], raw.len() as u64);
    LittleEndian::write_u64(&mut header[8..16], wire.len() as u64);
    Ok((header, wire))
}

/// Parses a length-leg header into `(raw_len, wire_len)`.
pub fn parse_state_header(header: &[u8]) -> Result<(u64, u64), Error> {
    if header.len() != STATE_FRAME_LEN {
        return Err(Error::MalformedStateFrame);
    }
    let raw_len = LittleEndian::read_u64(&header[0..8]);
    let wire_len = LittleEndian::read_u64(&header[8..16]);
    Ok((raw_len, wire_len))
}

/// Recovers the raw state bytes from a data leg, decompressing if the header
/// says the payload was compressed.
pub fn unpack_state(raw_len: u64, wire: Vec<u8>) -> Result<Vec<u8>, Error> {
    let expected =
        usize::try_from(raw_len).map_err(|_| Error::MessageLengthOverflowed)?;
    let raw = if wire.len() == expected {
        wire
    } else {
        zstd::bulk::decompress(&wire, expected)?
    };
    if raw.len() != expected {
        return Err(Error::MalformedStateFrame);
    }
    Ok(raw)
}
