//! Execution coordinator
//!
//! Owns one sandbox instance at a time and drives it through
//! `Uninitialized -> Loading -> Ready -> Running -> (AwaitingInput | Ready)`.
//! Interactive runs go through the state machine. Test runs are tagged with
//! a correlation id and routed to their caller without touching it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::channel::{Inbound, MessageChannel};
use super::launcher::SandboxLauncher;
use super::protocol::{Envelope, ErrorPayload, ExecutionOutput, Request, WorkerMessage};
use crate::core::{CorrelationId, ExecutionContext, ResumeContext};
use crate::error::{CoordinatorError, ProtocolError};

const EVENT_CAPACITY: usize = 256;
const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Message used when a test-mode run blocks on input instead of failing
pub const INPUT_OVERRUN_MESSAGE: &str = "program asked for more input than available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Loading,
    Ready,
    Running,
    AwaitingInput,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Loading => "loading",
            Phase::Ready => "ready",
            Phase::Running => "running",
            Phase::AwaitingInput => "awaiting_input",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// How long `load` waits for the sandbox to report `loaded`
    pub load_timeout: Duration,
    /// Upper bound for one interactive run; on expiry the sandbox is reloaded
    pub run_timeout: Option<Duration>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            run_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    RuntimeError,
    /// Ran out of input in test mode
    InputExhausted,
}

/// Result of an interactive (or uncorrelated test-mode) run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        output: ExecutionOutput,
    },
    /// The program is waiting for the user; answer with `provide_input`
    AwaitingInput {
        prompt: String,
    },
    Failed {
        reason: RunFailure,
        message: String,
        /// Output captured before the failure
        output: String,
    },
}

/// Raw response to a correlated request
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelatedReply {
    Output(ExecutionOutput),
    Error(ErrorPayload),
    InputRequested { prompt: String },
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    Status {
        message: String,
    },
    PhaseChanged {
        phase: Phase,
    },
    InputRequested {
        prompt: String,
    },
    FileExport {
        file_name: String,
        #[serde(skip)]
        data: Vec<u8>,
    },
    ProtocolError {
        message: String,
    },
}

type RunWaiter = oneshot::Sender<Result<RunOutcome, CoordinatorError>>;
type ReplyWaiter = oneshot::Sender<Result<CorrelatedReply, CoordinatorError>>;

struct ActiveRun {
    resume: ResumeContext,
    test_mode: bool,
    waiter: RunWaiter,
}

struct PendingInput {
    prompt: String,
    resume: ResumeContext,
    /// The sandbox itself is blocked in `input()` and expects PROVIDE_INPUT.
    /// Otherwise the run already ended and is replayed with the new value.
    sandbox_blocked: bool,
}

struct State {
    phase: Phase,
    channel: Option<MessageChannel>,
    /// Bumped whenever the sandbox is retired; messages from older
    /// generations are dropped
    generation: u64,
    packages: Option<BTreeSet<String>>,
    load_error: Option<String>,
    active_run: Option<ActiveRun>,
    pending_input: Option<PendingInput>,
    /// A pending input was discarded by a teardown and nobody has asked
    /// for it since
    input_reset: bool,
}

struct Shared {
    launcher: Arc<dyn SandboxLauncher>,
    settings: CoordinatorSettings,
    // Lock order: state, then pending. Neither is held across an await.
    state: Mutex<State>,
    pending: Mutex<HashMap<CorrelationId, ReplyWaiter>>,
    phase_tx: watch::Sender<Phase>,
    events: broadcast::Sender<CoordinatorEvent>,
    next_id: AtomicU64,
}

/// Handle to the coordinator. Cheap to clone; all clones drive the same sandbox.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

enum LoadAction {
    Done,
    Wait,
    Launch(u64),
}

impl Coordinator {
    pub fn new(launcher: Arc<dyn SandboxLauncher>, settings: CoordinatorSettings) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                launcher,
                settings,
                state: Mutex::new(State {
                    phase: Phase::Uninitialized,
                    channel: None,
                    generation: 0,
                    packages: None,
                    load_error: None,
                    active_run: None,
                    pending_input: None,
                    input_reset: false,
                }),
                pending: Mutex::new(HashMap::new()),
                phase_tx,
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.state().phase
    }

    #[cfg(test)]
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.shared.phase_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.events.subscribe()
    }

    /// Prompt of the interactive input currently awaited, if any
    #[cfg(test)]
    pub fn pending_prompt(&self) -> Option<String> {
        self.shared
            .state()
            .pending_input
            .as_ref()
            .map(|pending| pending.prompt.clone())
    }

    #[cfg(test)]
    pub fn pending_correlated_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Start a sandbox with the given packages and wait until it is ready.
    ///
    /// Joins an in-progress load of the same packages. A ready sandbox with a
    /// different package set is replaced.
    pub async fn load(&self, packages: BTreeSet<String>) -> Result<(), CoordinatorError> {
        let action = {
            let mut state = self.shared.state();
            let same_packages = state.packages.as_ref() == Some(&packages);
            match state.phase {
                Phase::Ready if same_packages => LoadAction::Done,
                Phase::Loading if same_packages => LoadAction::Wait,
                Phase::Uninitialized | Phase::Ready => {
                    if state.phase == Phase::Ready {
                        info!("Replacing sandbox to load a different package set");
                        self.shared.teardown(&mut state);
                    }
                    state.packages = Some(packages.clone());
                    state.load_error = None;
                    self.shared.set_phase(&mut state, Phase::Loading);
                    LoadAction::Launch(state.generation)
                }
                phase => return Err(CoordinatorError::Busy { phase }),
            }
        };

        match action {
            LoadAction::Done => Ok(()),
            LoadAction::Wait => self.wait_loaded().await,
            LoadAction::Launch(generation) => {
                info!("Loading sandbox with packages {:?}", packages);
                self.shared.launch_into(generation, packages).await;
                self.wait_loaded().await
            }
        }
    }

    /// Execute a context and wait for its outcome.
    ///
    /// Only one run may be in flight; a second call while running or waiting
    /// for input is rejected with `Busy`.
    pub async fn run(&self, context: ExecutionContext) -> Result<RunOutcome, CoordinatorError> {
        if context.correlation_id.is_some() {
            return Err(CoordinatorError::InvalidContext(
                "correlated requests must go through run_correlated".to_string(),
            ));
        }
        context.validate()?;

        let waiter = {
            let mut state = self.shared.state();
            match state.phase {
                Phase::Ready => {}
                phase @ (Phase::Running | Phase::AwaitingInput) => {
                    return Err(CoordinatorError::Busy { phase })
                }
                phase => return Err(CoordinatorError::NotReady { phase }),
            }
            self.shared.start_run(
                &mut state,
                &Request::run(&context),
                context.resume_context(),
                context.test_mode,
            )?
        };
        self.await_run(waiter).await
    }

    /// Answer the pending interactive prompt and wait for the resumed run.
    ///
    /// The resumed run sees only `value` as input; earlier inputs are not
    /// replayed. A prompt discarded by an interrupt or crash fails once with
    /// `Reset`.
    pub async fn provide_input(
        &self,
        value: impl Into<String>,
    ) -> Result<RunOutcome, CoordinatorError> {
        let value = value.into();
        let waiter = {
            let mut state = self.shared.state();
            let Some(pending) = state.pending_input.take() else {
                return Err(if std::mem::take(&mut state.input_reset) {
                    CoordinatorError::Reset
                } else {
                    CoordinatorError::NoPendingInput
                });
            };
            debug!("Answering prompt {:?}", pending.prompt);

            let request = if pending.sandbox_blocked {
                Request::ProvideInput {
                    input: value.clone(),
                }
            } else {
                Request::run(&pending.resume.clone().into_context(vec![value.clone()]))
            };

            match self
                .shared
                .start_run(&mut state, &request, pending.resume.clone(), false)
            {
                Ok(waiter) => waiter,
                Err(e) => {
                    state.pending_input = Some(pending);
                    return Err(e);
                }
            }
        };
        self.await_run(waiter).await
    }

    /// Send a test-mode request tagged with a fresh correlation id and wait
    /// for the response carrying that id.
    ///
    /// Safe to call concurrently. On timeout the request is unregistered, so
    /// a late response is discarded.
    pub async fn run_correlated(
        &self,
        mut context: ExecutionContext,
        deadline: Duration,
    ) -> Result<CorrelatedReply, CoordinatorError> {
        context.validate()?;
        let id = self.shared.next_correlation_id();
        context.correlation_id = Some(id.clone());
        context.test_mode = true;

        let (tx, rx) = oneshot::channel();
        let _guard = {
            let state = self.shared.state();
            match state.phase {
                Phase::Ready | Phase::Running => {}
                Phase::AwaitingInput => {
                    return Err(CoordinatorError::Busy {
                        phase: Phase::AwaitingInput,
                    })
                }
                phase => return Err(CoordinatorError::NotReady { phase }),
            }
            // Register before sending so a fast reply cannot slip past
            self.shared.pending().insert(id.clone(), tx);
            let guard = PendingGuard {
                shared: &self.shared,
                id: id.clone(),
            };
            Shared::send(&state, &Request::run(&context))?;
            guard
        };
        debug!(correlation_id = %id, "Dispatched test request");

        match timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CoordinatorError::Reset),
            Err(_) => {
                warn!(correlation_id = %id, "Test request timed out after {:?}", deadline);
                Err(CoordinatorError::Timeout)
            }
        }
    }

    /// Kill the sandbox, fail everything pending with `Reset`, and reload the
    /// last package set. Returns once the reload has been started.
    pub async fn interrupt(&self) {
        let reload = {
            let mut state = self.shared.state();
            info!("Interrupting sandbox in phase {}", state.phase);
            self.shared.teardown(&mut state);
            self.shared.begin_reload(&mut state)
        };
        if let Some((generation, packages)) = reload {
            self.shared.launch_into(generation, packages).await;
        }
    }

    /// Stop the sandbox without reloading. Pending calls fail with `Reset`.
    pub fn shutdown(&self) {
        let mut state = self.shared.state();
        self.shared.teardown(&mut state);
        state.packages = None;
        state.load_error = None;
        self.shared.set_phase(&mut state, Phase::Uninitialized);
        info!("Coordinator shut down");
    }

    async fn wait_loaded(&self) -> Result<(), CoordinatorError> {
        let limit = self.shared.settings.load_timeout;
        let mut phase_rx = self.shared.phase_tx.subscribe();
        let settled = timeout(limit, async {
            phase_rx
                .wait_for(|phase| *phase != Phase::Loading)
                .await
                .map(|phase| *phase)
        })
        .await;

        match settled {
            Ok(Ok(Phase::Uninitialized)) => {
                let state = self.shared.state();
                Err(match &state.load_error {
                    Some(message) => CoordinatorError::SandboxLoad(message.clone()),
                    None => CoordinatorError::Reset,
                })
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CoordinatorError::Reset),
            Err(_) => {
                let message = format!("sandbox did not load within {:?}", limit);
                let mut state = self.shared.state();
                if state.phase == Phase::Loading {
                    self.shared.fail_load(&mut state, message.clone());
                }
                Err(CoordinatorError::SandboxLoad(message))
            }
        }
    }

    async fn await_run(
        &self,
        waiter: oneshot::Receiver<Result<RunOutcome, CoordinatorError>>,
    ) -> Result<RunOutcome, CoordinatorError> {
        let received = match self.shared.settings.run_timeout {
            Some(limit) => match timeout(limit, waiter).await {
                Ok(received) => received,
                Err(_) => {
                    warn!("Run exceeded {:?}, interrupting sandbox", limit);
                    self.interrupt().await;
                    return Err(CoordinatorError::Timeout);
                }
            },
            None => waiter.await,
        };
        received.unwrap_or(Err(CoordinatorError::Reset))
    }
}

/// Removes a correlated request from the pending map however the call ends
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<CorrelationId, ReplyWaiter>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_phase(&self, state: &mut State, phase: Phase) {
        if state.phase == phase {
            return;
        }
        debug!("Phase {} -> {}", state.phase, phase);
        state.phase = phase;
        self.phase_tx.send_replace(phase);
        self.emit(CoordinatorEvent::PhaseChanged { phase });
    }

    fn next_correlation_id(&self) -> CorrelationId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        CorrelationId::new(format!("test-{}-{}", millis, seq))
    }

    fn send(state: &State, request: &Request) -> Result<(), CoordinatorError> {
        let channel = state
            .channel
            .as_ref()
            .ok_or(CoordinatorError::NotReady { phase: state.phase })?;
        channel.send(request)?;
        Ok(())
    }

    fn start_run(
        &self,
        state: &mut State,
        request: &Request,
        resume: ResumeContext,
        test_mode: bool,
    ) -> Result<oneshot::Receiver<Result<RunOutcome, CoordinatorError>>, CoordinatorError> {
        Self::send(state, request)?;
        let (tx, rx) = oneshot::channel();
        state.input_reset = false;
        state.active_run = Some(ActiveRun {
            resume,
            test_mode,
            waiter: tx,
        });
        self.set_phase(state, Phase::Running);
        Ok(rx)
    }

    /// Retire the current sandbox and fail everything waiting on it
    fn teardown(&self, state: &mut State) {
        state.generation += 1;
        if let Some(mut channel) = state.channel.take() {
            channel.terminate();
        }
        if let Some(run) = state.active_run.take() {
            let _ = run.waiter.send(Err(CoordinatorError::Reset));
        }
        if state.pending_input.take().is_some() {
            debug!("Discarded pending interactive input");
            state.input_reset = true;
        }

        let waiters: Vec<ReplyWaiter> = self.pending().drain().map(|(_, w)| w).collect();
        if !waiters.is_empty() {
            info!("Failing {} pending test request(s) with reset", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(Err(CoordinatorError::Reset));
        }
    }

    /// After a teardown: move to Loading if there is a package set to reload
    fn begin_reload(&self, state: &mut State) -> Option<(u64, BTreeSet<String>)> {
        match state.packages.clone() {
            Some(packages) => {
                state.load_error = None;
                self.set_phase(state, Phase::Loading);
                Some((state.generation, packages))
            }
            None => {
                self.set_phase(state, Phase::Uninitialized);
                None
            }
        }
    }

    fn fail_load(&self, state: &mut State, message: String) {
        warn!("Sandbox failed to load: {}", message);
        self.teardown(state);
        state.load_error = Some(message);
        self.set_phase(state, Phase::Uninitialized);
    }

    async fn launch_into(self: &Arc<Self>, generation: u64, packages: BTreeSet<String>) {
        let launched = self.launcher.launch().await;

        let mut state = self.state();
        if state.generation != generation {
            debug!("Discarding sandbox launched for retired generation {}", generation);
            return;
        }
        let mut channel = match launched {
            Ok(channel) => channel,
            Err(e) => {
                self.fail_load(&mut state, format!("{:#}", e));
                return;
            }
        };
        let Some(inbound) = channel.take_inbound() else {
            self.fail_load(&mut state, "sandbox channel has no inbound stream".to_string());
            return;
        };
        if let Err(e) = channel.send(&Request::Load { packages }) {
            self.fail_load(&mut state, e.to_string());
            return;
        }

        tokio::spawn(route(Arc::downgrade(self), generation, inbound));
        state.channel = Some(channel);
    }

    fn dispatch(&self, generation: u64, envelope: Envelope) {
        let mut state = self.state();
        if state.generation != generation {
            debug!(
                "Dropping {} message from retired sandbox",
                envelope.message.kind()
            );
            return;
        }

        if let Some(id) = envelope.correlation_id {
            self.resolve_correlated(id, envelope.message);
            return;
        }

        match envelope.message {
            WorkerMessage::Status { message } => {
                info!("Sandbox status: {}", message);
                self.emit(CoordinatorEvent::Status { message });
            }
            WorkerMessage::Loaded => {
                if state.phase == Phase::Loading {
                    info!("Sandbox loaded");
                    self.set_phase(&mut state, Phase::Ready);
                } else {
                    debug!("Ignoring loaded message in phase {}", state.phase);
                }
            }
            WorkerMessage::Output(output) => match state.active_run.take() {
                Some(run) => {
                    self.set_phase(&mut state, Phase::Ready);
                    let _ = run.waiter.send(Ok(RunOutcome::Completed { output }));
                }
                None => debug!("Ignoring output with no active run"),
            },
            WorkerMessage::Error(payload) => self.on_error(&mut state, payload),
            WorkerMessage::RequestInput { prompt } => self.on_request_input(&mut state, prompt),
            WorkerMessage::FileExport(export) => {
                info!(
                    "Sandbox exported {} ({} bytes)",
                    export.file_name,
                    export.data.len()
                );
                self.emit(CoordinatorEvent::FileExport {
                    file_name: export.file_name,
                    data: export.data,
                });
            }
            WorkerMessage::Unknown { kind } => {
                self.protocol_error(&ProtocolError::UnknownKind(kind));
            }
            WorkerMessage::Invalid { kind, reason } => self.on_invalid(&mut state, kind, reason),
        }
    }

    fn resolve_correlated(&self, id: CorrelationId, message: WorkerMessage) {
        let reply = match message {
            WorkerMessage::Output(output) => Ok(CorrelatedReply::Output(output)),
            WorkerMessage::Error(payload) => Ok(CorrelatedReply::Error(payload)),
            WorkerMessage::RequestInput { prompt } => {
                Ok(CorrelatedReply::InputRequested { prompt })
            }
            WorkerMessage::Invalid { kind, reason } => {
                let error = ProtocolError::InvalidPayload { kind, reason };
                self.protocol_error(&error);
                Err(CoordinatorError::Protocol(error))
            }
            WorkerMessage::Unknown { kind } => {
                self.protocol_error(&ProtocolError::UnknownKind(kind));
                return;
            }
            other => {
                debug!(correlation_id = %id, "Ignoring tagged {} message", other.kind());
                return;
            }
        };

        match self.pending().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(
                correlation_id = %id,
                "Discarding response for unknown or expired request"
            ),
        }
    }

    fn on_error(&self, state: &mut State, payload: ErrorPayload) {
        if state.phase == Phase::Loading {
            self.fail_load(state, payload.message().to_string());
            return;
        }
        let Some(run) = state.active_run.take() else {
            warn!("Sandbox reported an error with no active run: {}", payload.message());
            return;
        };

        let exhausted = payload.is_input_exhausted();
        let outcome = if exhausted && !run.test_mode {
            let prompt = payload.captured_output().to_string();
            self.await_input(state, prompt.clone(), run.resume, false);
            RunOutcome::AwaitingInput { prompt }
        } else {
            self.set_phase(state, Phase::Ready);
            RunOutcome::Failed {
                reason: if exhausted {
                    RunFailure::InputExhausted
                } else {
                    RunFailure::RuntimeError
                },
                message: payload.message().to_string(),
                output: payload.captured_output().to_string(),
            }
        };
        let _ = run.waiter.send(Ok(outcome));
    }

    fn on_request_input(&self, state: &mut State, prompt: String) {
        let Some(run) = state.active_run.take() else {
            debug!("Ignoring input request with no active run");
            return;
        };

        let outcome = if run.test_mode {
            self.set_phase(state, Phase::Ready);
            RunOutcome::Failed {
                reason: RunFailure::InputExhausted,
                message: INPUT_OVERRUN_MESSAGE.to_string(),
                output: prompt,
            }
        } else {
            self.await_input(state, prompt.clone(), run.resume, true);
            RunOutcome::AwaitingInput { prompt }
        };
        let _ = run.waiter.send(Ok(outcome));
    }

    /// An untagged reply could not be decoded: settle whoever waits on it
    fn on_invalid(&self, state: &mut State, kind: String, reason: String) {
        let failed_load = kind == "error";
        let error = ProtocolError::InvalidPayload { kind, reason };
        self.protocol_error(&error);

        if state.phase == Phase::Loading {
            if failed_load {
                self.fail_load(state, error.to_string());
            }
            return;
        }
        let Some(run) = state.active_run.take() else {
            return;
        };
        self.set_phase(state, Phase::Ready);
        let _ = run.waiter.send(Ok(RunOutcome::Failed {
            reason: RunFailure::RuntimeError,
            message: error.to_string(),
            output: String::new(),
        }));
    }

    fn await_input(
        &self,
        state: &mut State,
        prompt: String,
        resume: ResumeContext,
        sandbox_blocked: bool,
    ) {
        state.pending_input = Some(PendingInput {
            prompt: prompt.clone(),
            resume,
            sandbox_blocked,
        });
        self.set_phase(state, Phase::AwaitingInput);
        self.emit(CoordinatorEvent::InputRequested { prompt });
    }

    fn protocol_error(&self, error: &ProtocolError) {
        warn!("{}", error);
        self.emit(CoordinatorEvent::ProtocolError {
            message: error.to_string(),
        });
    }

    fn malformed(&self, generation: u64, error: ProtocolError) {
        if self.state().generation == generation {
            self.protocol_error(&error);
        }
    }

    /// The sandbox stream ended without us retiring it
    fn channel_closed(self: &Arc<Self>, generation: u64) {
        let reload = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            if state.phase == Phase::Loading {
                self.fail_load(&mut state, "sandbox exited while loading".to_string());
                None
            } else {
                warn!(
                    "Sandbox exited unexpectedly in phase {}, reloading",
                    state.phase
                );
                self.teardown(&mut state);
                self.begin_reload(&mut state)
            }
        };

        if let Some((generation, packages)) = reload {
            let shared = self.clone();
            tokio::spawn(async move {
                shared.launch_into(generation, packages).await;
            });
        }
    }
}

/// Single long-lived consumer of one sandbox's messages
async fn route(
    shared: Weak<Shared>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(item) = inbound.recv().await {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        match item {
            Ok(envelope) => strong.dispatch(generation, envelope),
            Err(e) => strong.malformed(generation, e),
        }
    }
    if let Some(strong) = shared.upgrade() {
        strong.channel_closed(generation);
    }
}
