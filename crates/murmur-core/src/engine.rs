//! Single background worker hosting the model runtime.
//!
//! Callers never touch the runtime handle directly: `load()` spawns the worker
//! (once, shared by every concurrent caller), `infer()` sends it a command and
//! waits for the reply, `unload()` cancels it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use murmur_provider::{EngineHandle, ModelRuntime};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::EngineError;

const COMMAND_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Unloaded,
    Loading,
    Loaded,
    Inferring,
    Error,
}

enum Command {
    Infer {
        prompt: String,
        reply: oneshot::Sender<Result<String, EngineError>>,
        // Held until the worker is done with this prompt.
        permit: OwnedSemaphorePermit,
    },
    Reload {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

type LoadFuture = Shared<BoxFuture<'static, Result<bool, EngineError>>>;

struct Worker {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    load: Option<LoadFuture>,
    worker: Option<Worker>,
}

struct EngineShared {
    slot: Mutex<Slot>,
    state: watch::Sender<EngineState>,
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies a state change unless the worker that asked for it has been
    /// superseded by an unload.
    fn transition(&self, generation: u64, next: EngineState) {
        let slot = self.lock();
        if slot.generation == generation {
            self.state.send_replace(next);
        }
    }

    fn finish_inference(&self, generation: u64) {
        let slot = self.lock();
        if slot.generation == generation {
            self.state.send_if_modified(|state| {
                if *state == EngineState::Inferring {
                    *state = EngineState::Loaded;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn fail_load(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.generation == generation {
            slot.load = None;
            slot.worker = None;
            self.state.send_replace(EngineState::Error);
        }
    }
}

pub struct InferenceEngine {
    runtime: Arc<dyn ModelRuntime>,
    model_id: String,
    shared: Arc<EngineShared>,
    inference_slot: Arc<Semaphore>,
}

impl InferenceEngine {
    pub fn new(runtime: Arc<dyn ModelRuntime>, model_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(EngineState::Unloaded);
        Self {
            runtime,
            model_id: model_id.into(),
            shared: Arc::new(EngineShared {
                slot: Mutex::new(Slot::default()),
                state,
            }),
            inference_slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    /// Loads the model on the worker. Concurrent callers share one load; once
    /// the model is resident this resolves immediately with `Ok(true)`.
    pub async fn load(&self) -> Result<bool, EngineError> {
        let load = {
            let mut slot = self.shared.lock();
            match slot.load.clone() {
                Some(existing) => existing,
                None => {
                    slot.generation += 1;
                    let generation = slot.generation;
                    let cancel = CancellationToken::new();
                    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
                    let (ready_tx, ready_rx) = oneshot::channel();

                    tokio::spawn(run_worker(WorkerContext {
                        shared: Arc::clone(&self.shared),
                        runtime: Arc::clone(&self.runtime),
                        model_id: self.model_id.clone(),
                        generation,
                        commands: rx,
                        ready: ready_tx,
                        cancel: cancel.clone(),
                    }));

                    let load = async move {
                        match ready_rx.await {
                            Ok(Ok(())) => Ok(true),
                            Ok(Err(err)) => Err(err),
                            Err(_) => Err(EngineError::Cancelled),
                        }
                    }
                    .boxed()
                    .shared();

                    slot.worker = Some(Worker { tx, cancel });
                    slot.load = Some(load.clone());
                    self.shared.state.send_replace(EngineState::Loading);
                    tracing::info!(model = %self.model_id, generation, "loading model");
                    load
                }
            }
        };
        load.await
    }

    /// Runs one prompt. Fails fast with `Busy` while another prompt is on the
    /// worker and with `NotLoaded` unless the model is resident.
    pub async fn infer(&self, prompt: &str, timeout: Duration) -> Result<String, EngineError> {
        match self.state() {
            EngineState::Loaded => {}
            EngineState::Inferring => return Err(EngineError::Busy),
            _ => return Err(EngineError::NotLoaded),
        }

        let permit = Arc::clone(&self.inference_slot)
            .try_acquire_owned()
            .map_err(|_| EngineError::Busy)?;

        let tx = {
            let slot = self.shared.lock();
            slot.worker
                .as_ref()
                .map(|worker| worker.tx.clone())
                .ok_or(EngineError::NotLoaded)?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.try_send(Command::Infer {
            prompt: prompt.to_string(),
            reply: reply_tx,
            permit,
        })
        .map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EngineError::Busy,
            mpsc::error::TrySendError::Closed(_) => EngineError::Cancelled,
        })?;

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => {
                tracing::debug!(
                    model = %self.model_id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "inference finished"
                );
                result
            }
            Ok(Err(_)) => Err(EngineError::Cancelled),
            Err(_) => {
                let ms = timeout.as_millis() as u64;
                tracing::debug!(model = %self.model_id, timeout_ms = ms, "inference timed out");
                Err(EngineError::Timeout(ms))
            }
        }
    }

    /// Asks the worker to re-initialise the resident model.
    pub async fn reload(&self) -> Result<(), EngineError> {
        let tx = {
            let slot = self.shared.lock();
            slot.worker.as_ref().map(|worker| worker.tx.clone())
        };
        let tx = match (tx, self.state()) {
            (Some(tx), EngineState::Loaded | EngineState::Inferring) => tx,
            _ => return Err(EngineError::NotLoaded),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Reload { reply: reply_tx })
            .await
            .map_err(|_| EngineError::Cancelled)?;
        reply_rx.await.map_err(|_| EngineError::Cancelled)?
    }

    /// Cancels any in-flight load or inference and releases the model.
    pub fn unload(&self) {
        let worker = {
            let mut slot = self.shared.lock();
            slot.generation += 1;
            slot.load = None;
            self.shared.state.send_replace(EngineState::Unloaded);
            slot.worker.take()
        };
        if let Some(worker) = worker {
            worker.cancel.cancel();
            tracing::info!(model = %self.model_id, "model unloaded");
        }
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        let mut slot = self.shared.lock();
        if let Some(worker) = slot.worker.take() {
            worker.cancel.cancel();
        }
    }
}

struct WorkerContext {
    shared: Arc<EngineShared>,
    runtime: Arc<dyn ModelRuntime>,
    model_id: String,
    generation: u64,
    commands: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<(), EngineError>>,
    cancel: CancellationToken,
}

async fn run_worker(ctx: WorkerContext) {
    let WorkerContext {
        shared,
        runtime,
        model_id,
        generation,
        mut commands,
        ready,
        cancel,
    } = ctx;

    let created = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = ready.send(Err(EngineError::Cancelled));
            return;
        }
        created = runtime.create_engine(&model_id) => created,
    };

    let mut handle: Box<dyn EngineHandle> = match created {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(model = %model_id, error = %err, "model load failed");
            shared.fail_load(generation);
            let _ = ready.send(Err(EngineError::LoadFailed(err.to_string())));
            return;
        }
    };

    shared.transition(generation, EngineState::Loaded);
    let _ = ready.send(Ok(()));
    tracing::info!(model = %model_id, "model loaded");

    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Infer {
                prompt,
                reply,
                permit,
            } => {
                shared.transition(generation, EngineState::Inferring);
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    out = handle.complete(&prompt) => {
                        Some(out.map_err(|e| EngineError::InferenceFailed(e.to_string())))
                    }
                };
                shared.finish_inference(generation);
                drop(permit);
                match outcome {
                    Some(result) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        let _ = reply.send(Err(EngineError::Cancelled));
                        break;
                    }
                }
            }
            Command::Reload { reply } => {
                let result = handle
                    .reload()
                    .await
                    .map_err(|e| EngineError::LoadFailed(e.to_string()));
                let _ = reply.send(result);
            }
        }
    }

    if let Err(err) = handle.unload().await {
        tracing::debug!(model = %model_id, error = %err, "model unload reported an error");
    }
    tracing::debug!(model = %model_id, generation, "inference worker stopped");
}
