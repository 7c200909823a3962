//! The emulator hosted on a dedicated tokio task.
//!
//! [`EmulatorHandle`] methods send a request over an `mpsc` channel and wait
//! on a `oneshot` reply, so every operation runs to completion on the worker
//! before the next one starts and callers only ever see snapshot copies.
//!
//! Cancellation is epoch based: each request carries the epoch current when
//! it was sent, and [`EmulatorHandle::cancel`] bumps it. The worker compares
//! epochs only between steps (or between the phases of a load), never inside
//! one, so a cancelled request leaves the engine at a step boundary.

use crate::machine::assembler::assemble;
use crate::machine::errors::{AsmError, EmulatorError};
use crate::machine::program::Program;
use crate::machine::registers::RegisterFile;
use crate::machine::state::{EngineState, MachineSnapshot, RunSummary, StepReport};
use crate::machine::vm::Emulator;
use asmbot_derive::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

/// Pending requests the channel holds before senders wait.
const COMMAND_CAPACITY: usize = 32;

/// Steps between cooperative yields during a run.
const YIELD_INTERVAL: u64 = 1024;

/// Errors returned through an [`EmulatorHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Assembly(#[from] AsmError),
    #[error("{0}")]
    Emulator(#[from] EmulatorError),
    #[error("request cancelled")]
    Cancelled,
    #[error("emulator worker has stopped")]
    Closed,
}

type Reply<T> = oneshot::Sender<Result<T, WorkerError>>;

enum Request {
    Reset {
        reply: Reply<StepReport>,
    },
    LoadSource {
        source: String,
        reply: Reply<StepReport>,
    },
    LoadProgram {
        program: Program,
        reply: Reply<StepReport>,
    },
    Step {
        reply: Reply<StepReport>,
    },
    StepBack {
        reply: Reply<StepReport>,
    },
    ReplayToStart {
        reply: Reply<(usize, StepReport)>,
    },
    Run {
        max_steps: u64,
        reply: Reply<RunSummary>,
    },
    Snapshot {
        reply: Reply<MachineSnapshot>,
    },
    Registers {
        reply: Reply<RegisterFile>,
    },
    ReadMemory {
        addr: u32,
        len: usize,
        reply: Reply<Vec<u8>>,
    },
    WriteMemory {
        addr: u32,
        bytes: Vec<u8>,
        reply: Reply<()>,
    },
}

/// A request tagged with the cancellation epoch it was sent under.
struct Command {
    epoch: u64,
    request: Request,
}

/// Cloneable handle to an emulator running on its own task.
///
/// The worker stops once every handle is dropped.
#[derive(Clone)]
pub struct EmulatorHandle {
    command_tx: mpsc::Sender<Command>,
    epoch: Arc<AtomicU64>,
}

impl EmulatorHandle {
    /// Spawns the worker task with an `Uninitialized` emulator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn() -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let epoch = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            emulator: Emulator::new(),
            epoch: epoch.clone(),
            command_rx,
        };
        tokio::spawn(worker.run());
        Self { command_tx, epoch }
    }

    /// Cancels every request sent before this call.
    ///
    /// A running request stops at its next step boundary; queued ones are
    /// answered with [`WorkerError::Cancelled`] without running.
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, WorkerError> {
        let (reply, response) = oneshot::channel();
        let command = Command {
            epoch: self.epoch.load(Ordering::Acquire),
            request: build(reply),
        };
        self.command_tx
            .send(command)
            .await
            .map_err(|_| WorkerError::Closed)?;
        response.await.map_err(|_| WorkerError::Closed)?
    }

    pub async fn reset(&self) -> Result<StepReport, WorkerError> {
        self.request(|reply| Request::Reset { reply }).await
    }

    /// Resets, assembles `source` and loads it.
    ///
    /// On any failure or cancellation the engine is left reset in `Ready`
    /// with no code loaded.
    pub async fn load_source(&self, source: impl Into<String>) -> Result<StepReport, WorkerError> {
        let source = source.into();
        self.request(|reply| Request::LoadSource { source, reply })
            .await
    }

    /// Resets and loads an already assembled program.
    pub async fn load_program(&self, program: Program) -> Result<StepReport, WorkerError> {
        self.request(|reply| Request::LoadProgram { program, reply })
            .await
    }

    pub async fn step(&self) -> Result<StepReport, WorkerError> {
        self.request(|reply| Request::Step { reply }).await
    }

    pub async fn step_back(&self) -> Result<StepReport, WorkerError> {
        self.request(|reply| Request::StepBack { reply }).await
    }

    pub async fn replay_to_start(&self) -> Result<(usize, StepReport), WorkerError> {
        self.request(|reply| Request::ReplayToStart { reply }).await
    }

    /// Steps until halt, fault, cancellation or `max_steps`.
    ///
    /// Steps completed before a cancellation stay applied and undoable.
    pub async fn run(&self, max_steps: u64) -> Result<RunSummary, WorkerError> {
        self.request(|reply| Request::Run { max_steps, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<MachineSnapshot, WorkerError> {
        self.request(|reply| Request::Snapshot { reply }).await
    }

    pub async fn registers(&self) -> Result<RegisterFile, WorkerError> {
        self.request(|reply| Request::Registers { reply }).await
    }

    pub async fn read_memory(&self, addr: u32, len: usize) -> Result<Vec<u8>, WorkerError> {
        self.request(|reply| Request::ReadMemory { addr, len, reply })
            .await
    }

    pub async fn write_memory(&self, addr: u32, bytes: Vec<u8>) -> Result<(), WorkerError> {
        self.request(|reply| Request::WriteMemory { addr, bytes, reply })
            .await
    }
}

struct Worker {
    emulator: Emulator,
    epoch: Arc<AtomicU64>,
    command_rx: mpsc::Receiver<Command>,
}

impl Worker {
    async fn run(mut self) {
        crate::debug!("emulator worker started");
        while let Some(Command { epoch, request }) = self.command_rx.recv().await {
            self.handle(epoch, request).await;
        }
        crate::debug!("emulator worker stopped");
    }

    fn cancelled(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) != epoch
    }

    fn check(&self, epoch: u64) -> Result<(), WorkerError> {
        if self.cancelled(epoch) {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn handle(&mut self, epoch: u64, request: Request) {
        // A dropped receiver just means the caller stopped waiting.
        match request {
            Request::Reset { reply } => {
                let result = self.check(epoch).map(|()| {
                    self.emulator.reset();
                    self.emulator.report()
                });
                let _ = reply.send(result);
            }
            Request::LoadSource { source, reply } => {
                let result = self.load_source(epoch, &source).await;
                let _ = reply.send(result);
            }
            Request::LoadProgram { program, reply } => {
                let result = self.load_program(epoch, &program);
                let _ = reply.send(result);
            }
            Request::Step { reply } => {
                let result = self
                    .check(epoch)
                    .and_then(|()| self.emulator.step().map_err(Into::into));
                let _ = reply.send(result);
            }
            Request::StepBack { reply } => {
                let result = self
                    .check(epoch)
                    .and_then(|()| self.emulator.step_back().map_err(Into::into));
                let _ = reply.send(result);
            }
            Request::ReplayToStart { reply } => {
                let result = self
                    .check(epoch)
                    .and_then(|()| self.emulator.replay_to_start().map_err(Into::into));
                let _ = reply.send(result);
            }
            Request::Run { max_steps, reply } => {
                let result = self.run_steps(epoch, max_steps).await;
                let _ = reply.send(result);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Ok(self.emulator.snapshot()));
            }
            Request::Registers { reply } => {
                let _ = reply.send(Ok(self.emulator.registers().clone()));
            }
            Request::ReadMemory { addr, len, reply } => {
                let _ = reply.send(self.emulator.read_memory(addr, len).map_err(Into::into));
            }
            Request::WriteMemory { addr, bytes, reply } => {
                let result = self
                    .check(epoch)
                    .and_then(|()| self.emulator.write_memory(addr, &bytes).map_err(Into::into));
                let _ = reply.send(result);
            }
        }
    }

    async fn load_source(&mut self, epoch: u64, source: &str) -> Result<StepReport, WorkerError> {
        self.emulator.reset();
        self.check(epoch)?;
        let program = assemble(source)?;
        tokio::task::yield_now().await;
        self.check(epoch)?;
        self.load_program(epoch, &program)
    }

    fn load_program(&mut self, epoch: u64, program: &Program) -> Result<StepReport, WorkerError> {
        self.emulator.reset();
        self.check(epoch)?;
        if let Err(err) = self.emulator.load_program(program) {
            self.emulator.reset();
            return Err(err.into());
        }
        crate::info!(
            "loaded program: {} instructions, {} data bytes",
            program.len(),
            program.data.len()
        );
        Ok(self.emulator.report())
    }

    async fn run_steps(&mut self, epoch: u64, max_steps: u64) -> Result<RunSummary, WorkerError> {
        self.check(epoch)?;
        let state = self.emulator.state();
        if !state.can_step() {
            return Err(EmulatorError::NotReady { state }.into());
        }

        let mut summary = RunSummary {
            steps: 0,
            halted: false,
            stores: Vec::new(),
        };
        while summary.steps < max_steps && self.emulator.state() != EngineState::Halted {
            if self.cancelled(epoch) {
                crate::warn!("run cancelled after {} steps", summary.steps);
                return Err(WorkerError::Cancelled);
            }
            let report = self.emulator.step()?;
            summary.steps += 1;
            summary.stores.extend(report.stores);
            if summary.steps % YIELD_INTERVAL == 0 {
                tokio::task::yield_now().await;
            }
        }
        summary.halted = self.emulator.state() == EngineState::Halted;
        Ok(summary)
    }
}
