mod contract;
mod resample;

// A worker owns one rank's slice of the particle pool and executes whatever
// the manager tells it to, one instruction per round. The contract is kept
// deliberately synchronous at the round level: every rank runs the same
// sequence of collectives, so a rank that falls behind simply stalls its
// peers at the next collective rather than desynchronizing the round
// structure. There is no per-rank recovery; anything unexpected aborts the
// whole computation.

// Resampling is the one round with a real data plane. Particle ownership
// moves between ranks by serialize-on-source / deserialize-on-destination,
// tagged by particle index, with a single barrier separating "everything is
// in flight" from "everyone may now rewrite their local table". The drain at
// the end of the round guarantees rounds never overlap on the wire.

pub use contract::Worker;
pub use resample::{resample, RoundTiming};
