//! MITOSIS: a distributed particle-ensemble resampling protocol.
//!
//! Sequential-Monte-Carlo style simulations run many stochastic replicas
//! ("particles") spread across worker processes ("ranks"), coordinated by
//! one manager. Periodically the pool is resampled: low-weight particles
//! are discarded, high-weight ones replicated, and the survivors
//! redistributed across ranks according to an externally computed routing
//! plan. This crate implements the control plane (the worker contract state
//! machine driven by manager instructions) and the data plane (the
//! barrier-synchronized, index-tagged particle exchange), over an abstract
//! messaging substrate.

pub mod comm;
pub mod ensemble;
pub mod error;
#[cfg(feature = "manager")]
pub mod manager;
#[cfg(test)]
pub(crate) mod testutil;
pub mod wire;
#[cfg(feature = "worker")]
pub mod worker;

pub use error::Error;
