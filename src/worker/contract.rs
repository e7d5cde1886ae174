//! The worker contract: a per-process state machine that binds to the
//! manager's session and dispatches its instructions.

use chrono::Utc;
use tracing::{debug, debug_span, Instrument};

use super::resample::resample;
use crate::comm::Communicator;
use crate::ensemble::{Ensemble, Task};
use crate::error::Error;
use crate::wire::{
    CallOp, IndexAssignment, Instruction, RankReport, RoutingSlice, SessionHello, MANAGER_RANK,
};

/// Where the contract currently stands.
///
/// ```text
/// CONNECTING ──hello──▶ BOUND ──▶ AWAIT_INSTRUCTION ──EXIT──▶ TERMINATED
///                                   │           ▲
///                                 INIT        DONE
///                                   ▼           │
///                            AWAIT_ROUND_INSTRUCTION ◀─┐
///                                   │                  │
///                                   └──CALL / RESA─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Bound,
    AwaitInstruction,
    AwaitRoundInstruction,
    Terminated,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Connecting => "CONNECTING",
            State::Bound => "BOUND",
            State::AwaitInstruction => "AWAIT_INSTRUCTION",
            State::AwaitRoundInstruction => "AWAIT_ROUND_INSTRUCTION",
            State::Terminated => "TERMINATED",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionStats {
    call_rounds: u64,
    resample_rounds: u64,
    resample_micros: u64,
    sent: u64,
    received: u64,
    dropped: u64,
    replicated: u64,
}

/// One worker process. Owns its communicator and, between INIT and DONE, the
/// rank-local ensemble.
pub struct Worker<T: Task, C: Communicator> {
    comm: C,
    template: T,
    ensemble: Option<Ensemble<T>>,
    session: Option<u64>,
    stats: SessionStats,
}

impl<T: Task, C: Communicator> Worker<T, C> {
    pub fn new(comm: C, template: T) -> Self {
        Self {
            comm,
            template,
            ensemble: None,
            session: None,
            stats: SessionStats::default(),
        }
    }

    /// Runs the contract until EXIT. Any error is fatal to the whole
    /// distributed computation; the caller is expected to tear everything
    /// down rather than retry.
    pub async fn run(mut self) -> Result<(), Error> {
        let span = debug_span!("worker", rank = self.comm.rank());
        async move {
            let mut state = State::Connecting;
            while state != State::Terminated {
                state = self.step(state).await?;
            }
            debug!("terminated");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn step(&mut self, state: State) -> Result<State, Error> {
        match state {
            State::Connecting => {
                let hello =
                    SessionHello::decode(&self.comm.broadcast(MANAGER_RANK, None).await?)?;
                debug!(session = hello.session, "bound to manager session");
                self.session = Some(hello.session);
                Ok(State::Bound)
            }
            State::Bound => Ok(State::AwaitInstruction),
            State::AwaitInstruction => {
                match self.next_instruction().await? {
                    Instruction::Exit => Ok(State::Terminated),
                    Instruction::Init => {
                        self.handle_init().await?;
                        Ok(State::AwaitRoundInstruction)
                    }
                    other => Err(Error::UnexpectedInstruction {
                        state: state.name(),
                        opcode: other.opcode(),
                    }),
                }
            }
            State::AwaitRoundInstruction => {
                match self.next_instruction().await? {
                    Instruction::Call { op, results } => {
                        self.handle_call(&op, results).await?;
                        Ok(State::AwaitRoundInstruction)
                    }
                    Instruction::Resample => {
                        self.handle_resample().await?;
                        Ok(State::AwaitRoundInstruction)
                    }
                    Instruction::Done => {
                        self.handle_done().await?;
                        Ok(State::AwaitInstruction)
                    }
                    other => Err(Error::UnexpectedInstruction {
                        state: state.name(),
                        opcode: other.opcode(),
                    }),
                }
            }
            State::Terminated => Ok(State::Terminated),
        }
    }

    async fn next_instruction(&self) -> Result<Instruction, Error> {
        let bytes = self.comm.broadcast(MANAGER_RANK, None).await?;
        let instruction = Instruction::decode(&bytes)?;
        debug!(opcode = %instruction.opcode(), "instruction received");
        Ok(instruction)
    }

    async fn handle_init(&mut self) -> Result<(), Error> {
        let assignment =
            IndexAssignment::decode(&self.comm.scatter(MANAGER_RANK, None).await?)?;
        let mut ensemble = Ensemble::new(self.comm.rank(), self.template.clone());
        ensemble.init(&assignment.indices);
        self.ensemble = Some(ensemble);
        self.stats = SessionStats::default();
        self.comm.barrier().await
    }

    async fn handle_call(&mut self, op: &CallOp, results: bool) -> Result<(), Error> {
        let ensemble = self.ensemble.as_mut().ok_or(Error::NoEnsemble)?;
        let reply = ensemble.dispatch(op)?;
        self.stats.call_rounds += 1;
        self.comm.barrier().await?;
        if results {
            self.comm
                .gather(MANAGER_RANK, reply.unwrap_or_default())
                .await?;
        }
        Ok(())
    }

    async fn handle_resample(&mut self) -> Result<(), Error> {
        let slice = RoutingSlice::decode(&self.comm.scatter(MANAGER_RANK, None).await?)?;
        let ensemble = self.ensemble.as_mut().ok_or(Error::NoEnsemble)?;
        let timing = resample(ensemble, &slice.entries, &self.comm).await?;
        self.stats.resample_rounds += 1;
        self.stats.resample_micros += timing.elapsed_micros;
        self.stats.sent += timing.sent;
        self.stats.received += timing.received;
        self.stats.dropped += timing.dropped;
        self.stats.replicated += timing.replicated;
        self.comm.barrier().await
    }

    async fn handle_done(&mut self) -> Result<(), Error> {
        let mut ensemble = self.ensemble.take().ok_or(Error::NoEnsemble)?;
        let population = ensemble.len() as u64;
        ensemble.exit();
        let report = RankReport::builder()
            .rank(self.comm.rank())
            .call_rounds(self.stats.call_rounds)
            .resample_rounds(self.stats.resample_rounds)
            .resample_micros(self.stats.resample_micros)
            .particles_sent(self.stats.sent)
            .particles_received(self.stats.received)
            .particles_dropped(self.stats.dropped)
            .particles_replicated(self.stats.replicated)
            .population(population)
            .finished_at_micros(Utc::now().timestamp_micros())
            .build();
        self.comm.gather(MANAGER_RANK, report.encode()?).await?;
        debug!(population, "session closed");
        Ok(())
    }
}

#[cfg(all(test, feature = "manager"))]
mod tests {
    use super::*;
    use crate::comm::local::LocalGrid;
    use crate::manager::Manager;
    use crate::testutil::ByteTask;
    use crate::wire::{Opcode, PopulationReport, RoutingEntry, WeightReport};

    #[tokio::test]
    async fn full_session_against_two_workers() {
        let mut grids = LocalGrid::create(3);
        let g2 = grids.pop().unwrap();
        let g1 = grids.pop().unwrap();
        let g0 = grids.pop().unwrap();

        let w1 = tokio::spawn(Worker::new(g1, ByteTask::default()).run());
        let w2 = tokio::spawn(Worker::new(g2, ByteTask::default()).run());

        let manager = Manager::new(g0);
        manager.bootstrap().await.unwrap();
        manager.init(&[vec![0, 1], vec![2]]).await.unwrap();

        manager
            .call(CallOp::Step { count: 1 }, false)
            .await
            .unwrap();
        let weights = manager.call(CallOp::LogWeights, true).await.unwrap().unwrap();
        let report1 = WeightReport::decode(&weights[0]).unwrap();
        let report2 = WeightReport::decode(&weights[1]).unwrap();
        assert_eq!(
            report1.entries.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(report2.entries[0].index, 2);
        // 8 seed bytes plus one step byte
        assert_eq!(report2.entries[0].log_weight, 9.0);

        // replicate particle 0 into slots 0 and 1 on worker 1, kill particle
        // 1, migrate particle 2 over from worker 2
        let plan = vec![
            RoutingEntry { index: 0, source: 1, destination: 1, reindex: 0 },
            RoutingEntry { index: 0, source: 1, destination: 1, reindex: 1 },
            RoutingEntry { index: 2, source: 2, destination: 1, reindex: 2 },
        ];
        manager.resample(&plan).await.unwrap();

        let populations = manager.call(CallOp::Population, true).await.unwrap().unwrap();
        assert_eq!(
            PopulationReport::decode(&populations[0]).unwrap().indices,
            vec![0, 1, 2]
        );
        assert!(PopulationReport::decode(&populations[1])
            .unwrap()
            .indices
            .is_empty());

        let reports = manager.done().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].rank, 1);
        assert_eq!(reports[0].resample_rounds, 1);
        assert_eq!(reports[0].population, 3);
        assert_eq!(reports[0].particles_received, 1);
        assert_eq!(reports[0].particles_replicated, 1);
        assert_eq!(reports[0].particles_dropped, 1);
        assert_eq!(reports[1].rank, 2);
        assert_eq!(reports[1].population, 0);
        assert_eq!(reports[1].particles_sent, 1);

        manager.exit().await.unwrap();
        w1.await.unwrap().unwrap();
        w2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn back_to_back_sessions_reuse_the_worker() {
        let mut grids = LocalGrid::create(2);
        let g1 = grids.pop().unwrap();
        let g0 = grids.pop().unwrap();
        let worker = tokio::spawn(Worker::new(g1, ByteTask::default()).run());

        let manager = Manager::new(g0);
        manager.bootstrap().await.unwrap();
        for round in 0..2u64 {
            manager.init(&[vec![round, round + 10]]).await.unwrap();
            let reports = manager.done().await.unwrap();
            assert_eq!(reports[0].population, 2);
        }
        manager.exit().await.unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn round_instruction_before_init_is_fatal() {
        let mut grids = LocalGrid::create(2);
        let g1 = grids.pop().unwrap();
        let g0 = grids.pop().unwrap();
        let worker = tokio::spawn(Worker::new(g1, ByteTask::default()).run());

        let hello = SessionHello {
            session: 7,
            sent_at_micros: 0,
        };
        g0.broadcast(MANAGER_RANK, Some(hello.encode().unwrap()))
            .await
            .unwrap();
        let rogue = Instruction::Call {
            op: CallOp::LogWeights,
            results: false,
        };
        g0.broadcast(MANAGER_RANK, Some(rogue.encode().unwrap()))
            .await
            .unwrap();

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedInstruction {
                state: "AWAIT_INSTRUCTION",
                opcode: Opcode::Call,
            }
        ));
    }
}
