//! The rank-local particle collection and the task contract it manages.

use hashbrown::HashMap;
use tracing::debug;

use crate::comm::Rank;
use crate::error::Error;
use crate::wire::{CallOp, ParticleIndex, PopulationReport, WeightEntry, WeightReport};

/// One simulation replica's behaviour. Implementations own their model
/// state; the protocol only ever moves it around as the bytes produced by
/// [`Task::save`].
///
/// The operations below `load` are the closed capability set a CALL round
/// can reach through [`CallOp`]; there is no dispatch by name.
pub trait Task: Clone + Send + 'static {
    /// Serializes the replica's full state.
    fn save(&self) -> Result<Vec<u8>, Error>;

    /// Restores state previously produced by [`Task::save`], possibly on
    /// another rank.
    fn load(&mut self, state: &[u8]) -> Result<(), Error>;

    /// Called once when a fresh replica is cloned from the template at INIT,
    /// before any other operation. Seeding and per-replica setup go here.
    fn spawn_at(&mut self, index: ParticleIndex);

    /// Advances the model by `count` steps.
    fn step(&mut self, count: u64);

    /// Pushes an opaque parameter blob into the model.
    fn set_params(&mut self, params: &[u8]) -> Result<(), Error>;

    /// The replica's current log-weight.
    fn log_weight(&self) -> f64;
}

/// A worker's local population: local index -> live replica, plus the
/// template new replicas are cloned from. Exclusively owned and mutated by
/// its own rank; cross-rank transfer is always serialize/deserialize.
pub struct Ensemble<T: Task> {
    address: Rank,
    template: T,
    particles: HashMap<ParticleIndex, T>,
}

impl<T: Task> Ensemble<T> {
    pub fn new(address: Rank, template: T) -> Self {
        Self {
            address,
            template,
            particles: HashMap::new(),
        }
    }

    /// Spawns one replica per assigned index.
    pub fn init(&mut self, indices: &[ParticleIndex]) {
        debug!(rank = self.address, count = indices.len(), "ensemble init");
        self.particles.reserve(indices.len());
        for &index in indices {
            let mut task = self.template.clone();
            task.spawn_at(index);
            self.particles.insert(index, task);
        }
    }

    /// Releases every particle.
    pub fn exit(&mut self) {
        debug!(rank = self.address, count = self.particles.len(), "ensemble exit");
        self.particles.clear();
    }

    pub fn address(&self) -> Rank {
        self.address
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn contains(&self, index: ParticleIndex) -> bool {
        self.particles.contains_key(&index)
    }

    /// Local indices in ascending order.
    pub fn indices(&self) -> Vec<ParticleIndex> {
        let mut indices: Vec<_> = self.particles.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Serializes the particle at `index`.
    pub fn save_particle(&self, index: ParticleIndex) -> Result<Vec<u8>, Error> {
        let particle = self.particles.get(&index).ok_or(Error::MissingParticle {
            rank: self.address,
            index,
        })?;
        particle.save()
    }

    /// Applies one CALL operation to the whole population. Ops that report
    /// something return their encoded reply.
    pub fn dispatch(&mut self, op: &CallOp) -> Result<Option<Vec<u8>>, Error> {
        match op {
            CallOp::Step { count } => {
                for particle in self.particles.values_mut() {
                    particle.step(*count);
                }
                Ok(None)
            }
            CallOp::SetParams(params) => {
                for particle in self.particles.values_mut() {
                    particle.set_params(params)?;
                }
                Ok(None)
            }
            CallOp::LogWeights => {
                let mut entries: Vec<WeightEntry> = self
                    .particles
                    .iter()
                    .map(|(&index, particle)| WeightEntry {
                        index,
                        log_weight: particle.log_weight(),
                    })
                    .collect();
                entries.sort_unstable_by_key(|entry| entry.index);
                Ok(Some(WeightReport { entries }.encode()?))
            }
            CallOp::Population => Ok(Some(
                PopulationReport {
                    indices: self.indices(),
                }
                .encode()?,
            )),
        }
    }

    pub(crate) fn template(&self) -> &T {
        &self.template
    }

    pub(crate) fn take(&mut self, index: ParticleIndex) -> Option<T> {
        self.particles.remove(&index)
    }

    /// Drops every particle whose index fails the predicate; returns how
    /// many were dropped.
    pub(crate) fn retain_indices(&mut self, mut pred: impl FnMut(ParticleIndex) -> bool) -> u64 {
        let before = self.particles.len();
        self.particles.retain(|&index, _| pred(index));
        (before - self.particles.len()) as u64
    }

    /// Swaps in the post-round population.
    pub(crate) fn replace(&mut self, particles: HashMap<ParticleIndex, T>) {
        self.particles = particles;
    }

    #[cfg(test)]
    pub(crate) fn particle(&self, index: ParticleIndex) -> Option<&T> {
        self.particles.get(&index)
    }

    #[cfg(test)]
    pub(crate) fn insert_particle(&mut self, index: ParticleIndex, task: T) {
        self.particles.insert(index, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ByteTask;

    #[test]
    fn init_spawns_one_replica_per_index() {
        let mut ensemble = Ensemble::new(1, ByteTask::default());
        ensemble.init(&[3, 1, 8]);
        assert_eq!(ensemble.len(), 3);
        assert_eq!(ensemble.indices(), vec![1, 3, 8]);
        // spawn_at seeds each replica from its own index
        assert_eq!(
            ensemble.particle(8).unwrap().state,
            8u64.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn dispatch_step_touches_every_particle() {
        let mut ensemble = Ensemble::new(1, ByteTask::default());
        ensemble.init(&[0, 1]);
        let reply = ensemble.dispatch(&CallOp::Step { count: 2 }).unwrap();
        assert!(reply.is_none());
        assert_eq!(ensemble.particle(0).unwrap().state.len(), 8 + 2);
        assert_eq!(ensemble.particle(1).unwrap().state.len(), 8 + 2);
    }

    #[test]
    fn dispatch_weights_reports_sorted_population() {
        let mut ensemble = Ensemble::new(1, ByteTask::default());
        ensemble.init(&[5, 2]);
        let reply = ensemble.dispatch(&CallOp::LogWeights).unwrap().unwrap();
        let report = WeightReport::decode(&reply).unwrap();
        let indices: Vec<_> = report.entries.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2, 5]);
        for entry in &report.entries {
            assert_eq!(entry.log_weight, 8.0);
        }
    }

    #[test]
    fn exit_releases_everything() {
        let mut ensemble = Ensemble::new(1, ByteTask::default());
        ensemble.init(&[0, 1, 2]);
        ensemble.exit();
        assert!(ensemble.is_empty());
    }
}
