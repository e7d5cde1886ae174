use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use mitosis::comm::local::LocalGrid;
use mitosis::ensemble::Task;
use mitosis::manager::Manager;
use mitosis::wire::{CallOp, ParticleIndex, PopulationReport, RoutingEntry, WeightReport};
use mitosis::worker::Worker;
use mitosis::Error;

/// A one-dimensional random walker. Weight falls off with distance from the
/// origin, so resampling concentrates the pool near zero.
#[derive(Clone)]
struct Walker {
    index: u64,
    position: f64,
    rng: StdRng,
}

impl Walker {
    fn template() -> Self {
        Self {
            index: 0,
            position: 0.0,
            rng: StdRng::seed_from_u64(0),
        }
    }
}

impl Task for Walker {
    fn save(&self) -> Result<Vec<u8>, Error> {
        let mut state = Vec::with_capacity(16);
        state.extend_from_slice(&self.index.to_le_bytes());
        state.extend_from_slice(&self.position.to_le_bytes());
        Ok(state)
    }

    fn load(&mut self, state: &[u8]) -> Result<(), Error> {
        if state.len() != 16 {
            return Err(Error::Task("walker state must be 16 bytes".into()));
        }
        let mut index = [0u8; 8];
        let mut position = [0u8; 8];
        index.copy_from_slice(&state[0..8]);
        position.copy_from_slice(&state[8..16]);
        self.index = u64::from_le_bytes(index);
        self.position = f64::from_le_bytes(position);
        self.rng = StdRng::seed_from_u64(self.index ^ self.position.to_bits());
        Ok(())
    }

    fn spawn_at(&mut self, index: ParticleIndex) {
        self.index = index;
        self.position = 0.0;
        self.rng = StdRng::seed_from_u64(index);
    }

    fn step(&mut self, count: u64) {
        for _ in 0..count {
            self.position += self.rng.gen_range(-1.0..1.0);
        }
    }

    fn set_params(&mut self, params: &[u8]) -> Result<(), Error> {
        if params.len() != 8 {
            return Err(Error::Task("walker params must be one f64".into()));
        }
        let mut scale = [0u8; 8];
        scale.copy_from_slice(params);
        self.position *= f64::from_le_bytes(scale);
        Ok(())
    }

    fn log_weight(&self) -> f64 {
        -self.position * self.position
    }
}

const WORKERS: u32 = 2;
const PER_RANK: u64 = 3;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut grids = LocalGrid::create(WORKERS + 1);
    let manager_grid = grids.remove(0);
    let workers: Vec<_> = grids
        .into_iter()
        .map(|grid| tokio::spawn(Worker::new(grid, Walker::template()).run()))
        .collect();

    let manager = Manager::new(manager_grid);
    manager.bootstrap().await.unwrap();

    let assignments: Vec<Vec<u64>> = (0..WORKERS as u64)
        .map(|w| (w * PER_RANK..(w + 1) * PER_RANK).collect())
        .collect();
    manager.init(&assignments).await.unwrap();
    manager
        .call(CallOp::Step { count: 25 }, false)
        .await
        .unwrap();

    // pull the weights and build a toy plan: the best walker takes every
    // slot on worker 1, the next three survivors land on worker 2, the rest
    // of the pool dies
    let replies = manager.call(CallOp::LogWeights, true).await.unwrap().unwrap();
    let mut pool: Vec<(u32, u64, f64)> = Vec::new();
    for (offset, bytes) in replies.iter().enumerate() {
        let rank = offset as u32 + 1;
        for entry in WeightReport::decode(bytes).unwrap().entries {
            info!(rank, index = entry.index, log_weight = entry.log_weight, "weight");
            pool.push((rank, entry.index, entry.log_weight));
        }
    }
    pool.sort_by(|a, b| b.2.total_cmp(&a.2));

    let (best_rank, best_index, _) = pool[0];
    let mut plan: Vec<RoutingEntry> = (0..PER_RANK)
        .map(|slot| RoutingEntry {
            index: best_index,
            source: best_rank,
            destination: 1,
            reindex: slot,
        })
        .collect();
    for (slot, &(rank, index, _)) in pool[1..4].iter().enumerate() {
        plan.push(RoutingEntry {
            index,
            source: rank,
            destination: 2,
            reindex: slot as u64,
        });
    }
    manager.resample(&plan).await.unwrap();

    let replies = manager.call(CallOp::Population, true).await.unwrap().unwrap();
    let mut populations: HashMap<u32, Vec<u64>> = HashMap::new();
    for (offset, bytes) in replies.iter().enumerate() {
        let rank = offset as u32 + 1;
        populations.insert(rank, PopulationReport::decode(bytes).unwrap().indices);
    }
    for rank in 1..=WORKERS {
        println!("rank {rank} now holds slots {:?}", populations[&rank]);
    }

    for report in manager.done().await.unwrap() {
        println!(
            "rank {}: {} call rounds, {} resample rounds ({}us), sent {}, received {}, dropped {}, replicated {}",
            report.rank,
            report.call_rounds,
            report.resample_rounds,
            report.resample_micros,
            report.particles_sent,
            report.particles_received,
            report.particles_dropped,
            report.particles_replicated,
        );
    }
    manager.exit().await.unwrap();

    for worker in workers {
        worker.await.unwrap().unwrap();
    }
}
