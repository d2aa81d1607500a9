//! Card-to-identity binding workflow.
//!
//! [`BindingMachine`] is a pure reducer: operator actions, REST resolutions and
//! live events go in, [`Effect`]s come out. [`BindingController`] is the actor
//! that owns one machine per screen, performs the effects against a
//! [`KioskApi`] and publishes snapshots.

use std::sync::Arc;

use shared::{
    domain::{student_for_card, CardTag, Student},
    protocol::{CameraFrame, ServerEvent},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    api::KioskApi,
    error::{ConsoleError, RequestError},
    live_channel::LiveChannel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingPhase {
    Idle,
    CardSelected,
    Verified,
    CameraStarting,
    CameraLive,
    Capturing,
    Bound,
}

impl BindingPhase {
    /// Phases in which the collaborator's camera may be running for us.
    pub fn has_camera_session(self) -> bool {
        matches!(
            self,
            BindingPhase::CameraStarting | BindingPhase::CameraLive | BindingPhase::Capturing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingAction {
    SelectCard(CardTag),
    Verify,
    StartCamera,
    CaptureImage,
    StopCamera,
    RefreshPool,
    DismissMessages,
}

impl BindingAction {
    fn name(&self) -> &'static str {
        match self {
            BindingAction::SelectCard(_) => "select_card",
            BindingAction::Verify => "verify",
            BindingAction::StartCamera => "start_camera",
            BindingAction::CaptureImage => "capture_image",
            BindingAction::StopCamera => "stop_camera",
            BindingAction::RefreshPool => "refresh_pool",
            BindingAction::DismissMessages => "dismiss_messages",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("card {0} is not in the unassigned pool")]
    CardNotInPool(CardTag),
    #[error("no student is bound to the selected card yet")]
    NoStudent,
    #[error("{action} is not allowed while {phase:?}")]
    InvalidTransition {
        action: &'static str,
        phase: BindingPhase,
    },
}

/// Selection generation. Bumped on every card selection so that results of
/// requests issued for an earlier selection can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Epoch(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchPool,
    FetchStudent { epoch: Epoch, card: CardTag },
    StartCamera { epoch: Epoch },
    Capture { epoch: Epoch, card: CardTag },
    /// Best-effort stop; failures are logged only.
    ReleaseCamera,
}

#[derive(Debug)]
pub enum Resolution {
    PoolLoaded(Result<Vec<CardTag>, RequestError>),
    RosterLoaded {
        epoch: Epoch,
        card: CardTag,
        result: Result<Vec<Student>, RequestError>,
    },
    CameraStarted {
        epoch: Epoch,
        result: Result<(), RequestError>,
    },
    CaptureAccepted {
        epoch: Epoch,
        result: Result<(), RequestError>,
    },
    CameraReleased(Result<(), RequestError>),
}

/// Everything a binding screen renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSnapshot {
    pub phase: BindingPhase,
    pub pool: Vec<CardTag>,
    pub selected: Option<CardTag>,
    pub student: Option<Student>,
    pub preview: Option<CameraFrame>,
    /// Set while the workflow is in its error overlay; the phase is already the
    /// one control returned to.
    pub error: Option<ConsoleError>,
    pub notice: Option<String>,
}

impl Default for BindingSnapshot {
    fn default() -> Self {
        Self {
            phase: BindingPhase::Idle,
            pool: Vec::new(),
            selected: None,
            student: None,
            preview: None,
            error: None,
            notice: None,
        }
    }
}

pub struct BindingMachine {
    state: BindingSnapshot,
    epoch: u64,
}

impl Default for BindingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingMachine {
    pub fn new() -> Self {
        Self {
            state: BindingSnapshot::default(),
            epoch: 0,
        }
    }

    pub fn snapshot(&self) -> &BindingSnapshot {
        &self.state
    }

    pub fn phase(&self) -> BindingPhase {
        self.state.phase
    }

    fn current_epoch(&self) -> Epoch {
        Epoch(self.epoch)
    }

    fn reject(&self, action: &BindingAction) -> Rejected {
        Rejected::InvalidTransition {
            action: action.name(),
            phase: self.state.phase,
        }
    }

    /// Applies an operator action. A rejected action leaves the machine
    /// untouched.
    pub fn apply(&mut self, action: BindingAction) -> Result<Vec<Effect>, Rejected> {
        let phase = self.state.phase;
        match action {
            BindingAction::SelectCard(card) => {
                if !self.state.pool.contains(&card) {
                    return Err(Rejected::CardNotInPool(card));
                }
                self.epoch += 1;
                let mut effects = Vec::new();
                if phase.has_camera_session() {
                    effects.push(Effect::ReleaseCamera);
                }
                self.state.phase = BindingPhase::CardSelected;
                self.state.selected = Some(card.clone());
                self.state.student = None;
                self.state.preview = None;
                self.state.error = None;
                self.state.notice = None;
                effects.push(Effect::FetchStudent {
                    epoch: self.current_epoch(),
                    card,
                });
                Ok(effects)
            }
            BindingAction::Verify => {
                if phase != BindingPhase::CardSelected {
                    return Err(self.reject(&action));
                }
                if self.state.student.is_none() {
                    return Err(Rejected::NoStudent);
                }
                self.state.phase = BindingPhase::Verified;
                self.state.notice = Some("Student details verified successfully".to_string());
                Ok(Vec::new())
            }
            BindingAction::StartCamera => {
                if phase != BindingPhase::Verified {
                    return Err(self.reject(&action));
                }
                self.state.phase = BindingPhase::CameraStarting;
                self.state.error = None;
                Ok(vec![Effect::StartCamera {
                    epoch: self.current_epoch(),
                }])
            }
            BindingAction::CaptureImage => {
                let Some(card) = self.state.selected.clone() else {
                    return Err(self.reject(&action));
                };
                if phase != BindingPhase::CameraLive {
                    return Err(self.reject(&action));
                }
                self.state.phase = BindingPhase::Capturing;
                self.state.error = None;
                Ok(vec![Effect::Capture {
                    epoch: self.current_epoch(),
                    card,
                }])
            }
            BindingAction::StopCamera => {
                if !matches!(phase, BindingPhase::CameraLive | BindingPhase::Capturing) {
                    return Err(self.reject(&action));
                }
                self.end_camera_session();
                Ok(vec![Effect::ReleaseCamera])
            }
            BindingAction::RefreshPool => Ok(vec![Effect::FetchPool]),
            BindingAction::DismissMessages => {
                self.state.error = None;
                self.state.notice = None;
                Ok(Vec::new())
            }
        }
    }

    fn end_camera_session(&mut self) {
        self.state.phase = BindingPhase::Verified;
        self.state.preview = None;
    }

    fn fail_camera_session(&mut self, message: impl Into<String>) -> Vec<Effect> {
        self.end_camera_session();
        self.state.error = Some(ConsoleError::camera(message));
        vec![Effect::ReleaseCamera]
    }

    fn is_stale(&self, epoch: Epoch, expected: BindingPhase) -> bool {
        epoch != self.current_epoch() || self.state.phase != expected
    }

    /// Folds the result of an earlier effect back in.
    pub fn resolve(&mut self, resolution: Resolution) -> Vec<Effect> {
        match resolution {
            Resolution::PoolLoaded(Ok(pool)) => {
                self.state.pool = pool;
                Vec::new()
            }
            Resolution::PoolLoaded(Err(err)) => {
                self.state.error = Some(ConsoleError::data_fetch(
                    "Failed to fetch unassigned cards",
                    &err,
                ));
                Vec::new()
            }
            Resolution::RosterLoaded {
                epoch,
                card,
                result,
            } => {
                if epoch != self.current_epoch() || self.state.selected.as_ref() != Some(&card) {
                    debug!(card_id = %card, "discarding stale student lookup");
                    return Vec::new();
                }
                match result {
                    Ok(roster) => {
                        self.state.student = student_for_card(&roster, &card).cloned();
                        if self.state.student.is_none() {
                            debug!(card_id = %card, "no student bound to card yet");
                        }
                    }
                    Err(err) => {
                        self.state.error = Some(ConsoleError::data_fetch(
                            "Failed to fetch student details",
                            &err,
                        ));
                    }
                }
                Vec::new()
            }
            Resolution::CameraStarted { epoch, result } => {
                if self.is_stale(epoch, BindingPhase::CameraStarting) {
                    debug!("discarding stale camera start");
                    if result.is_ok() && !self.state.phase.has_camera_session() {
                        return vec![Effect::ReleaseCamera];
                    }
                    return Vec::new();
                }
                match result {
                    Ok(()) => {
                        self.state.phase = BindingPhase::CameraLive;
                        Vec::new()
                    }
                    Err(err) => {
                        self.state.phase = BindingPhase::Verified;
                        self.state.error = Some(ConsoleError::camera(format!(
                            "Failed to start camera: {}",
                            err.operator_message()
                        )));
                        Vec::new()
                    }
                }
            }
            Resolution::CaptureAccepted { epoch, result } => {
                if self.is_stale(epoch, BindingPhase::Capturing) {
                    debug!("discarding stale capture response");
                    return Vec::new();
                }
                match result {
                    Ok(()) => Vec::new(),
                    Err(err) => self.fail_camera_session(err.operator_message()),
                }
            }
            Resolution::CameraReleased(result) => {
                if let Err(err) = result {
                    warn!(%err, "stop-camera request failed; session already ended locally");
                }
                Vec::new()
            }
        }
    }

    /// Handles a pushed event other than a camera frame.
    pub fn on_event(&mut self, event: &ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::ImageCaptured(captured) => {
                let matches_selection = captured
                    .card_id
                    .as_ref()
                    .map_or(true, |card| self.state.selected.as_ref() == Some(card));
                if self.state.phase != BindingPhase::Capturing || !matches_selection {
                    debug!("image captured outside of a capture; refreshing pool only");
                    return vec![Effect::FetchPool];
                }
                if !captured.success {
                    let mut effects = self.fail_camera_session("Image capture failed");
                    effects.push(Effect::FetchPool);
                    return effects;
                }
                info!(card_id = ?self.state.selected, "card bound to captured image");
                self.state.phase = BindingPhase::Bound;
                self.state.preview = None;
                self.state.error = None;
                self.state.notice = Some("Image captured and saved successfully".to_string());
                vec![Effect::ReleaseCamera, Effect::FetchPool]
            }
            ServerEvent::CameraError(camera_error) => {
                if self.state.phase.has_camera_session() {
                    self.fail_camera_session(camera_error.message.clone())
                } else {
                    self.state.error = Some(ConsoleError::camera(camera_error.message.clone()));
                    Vec::new()
                }
            }
            ServerEvent::CameraFrame(frame) => {
                self.on_frame(frame.clone());
                Vec::new()
            }
            ServerEvent::AttendanceMarked(_) => Vec::new(),
        }
    }

    /// Replaces the preview while a camera session is running; frames that
    /// arrive outside a session are dropped.
    pub fn on_frame(&mut self, frame: CameraFrame) {
        if matches!(
            self.state.phase,
            BindingPhase::CameraLive | BindingPhase::Capturing
        ) {
            self.state.preview = Some(frame);
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Rejected(#[from] Rejected),
    #[error("binding controller has stopped")]
    Stopped,
}

struct ControlMessage {
    action: BindingAction,
    reply: oneshot::Sender<Result<(), Rejected>>,
}

/// Owns the binding workflow of one screen. Dropping it stops the actor and
/// abandons any in-flight requests.
pub struct BindingController {
    commands: mpsc::Sender<ControlMessage>,
    snapshots: watch::Receiver<BindingSnapshot>,
    task: JoinHandle<()>,
}

impl BindingController {
    pub fn mount(api: Arc<dyn KioskApi>, channel: &LiveChannel) -> Self {
        Self::spawn(api, channel.subscribe(), channel.frames())
    }

    pub fn spawn(
        api: Arc<dyn KioskApi>,
        events: broadcast::Receiver<ServerEvent>,
        frames: watch::Receiver<Option<CameraFrame>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshots) = watch::channel(BindingSnapshot::default());
        let task = tokio::spawn(run_controller(api, command_rx, events, frames, snapshot_tx));
        Self {
            commands,
            snapshots,
            task,
        }
    }

    pub async fn dispatch(&self, action: BindingAction) -> Result<(), DispatchError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(ControlMessage { action, reply })
            .await
            .map_err(|_| DispatchError::Stopped)?;
        reply_rx.await.map_err(|_| DispatchError::Stopped)??;
        Ok(())
    }

    pub async fn select_card(&self, card: CardTag) -> Result<(), DispatchError> {
        self.dispatch(BindingAction::SelectCard(card)).await
    }

    pub async fn verify(&self) -> Result<(), DispatchError> {
        self.dispatch(BindingAction::Verify).await
    }

    pub async fn start_camera(&self) -> Result<(), DispatchError> {
        self.dispatch(BindingAction::StartCamera).await
    }

    pub async fn capture_image(&self) -> Result<(), DispatchError> {
        self.dispatch(BindingAction::CaptureImage).await
    }

    pub async fn stop_camera(&self) -> Result<(), DispatchError> {
        self.dispatch(BindingAction::StopCamera).await
    }

    pub async fn refresh_pool(&self) -> Result<(), DispatchError> {
        self.dispatch(BindingAction::RefreshPool).await
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<BindingSnapshot> {
        self.snapshots.clone()
    }
}

impl Drop for BindingController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn perform(api: &Arc<dyn KioskApi>, inflight: &mut JoinSet<Resolution>, effect: Effect) {
    let api = Arc::clone(api);
    match effect {
        Effect::FetchPool => {
            inflight.spawn(async move { Resolution::PoolLoaded(api.unassigned_cards().await) });
        }
        Effect::FetchStudent { epoch, card } => {
            inflight.spawn(async move {
                let result = api.list_students().await;
                Resolution::RosterLoaded {
                    epoch,
                    card,
                    result,
                }
            });
        }
        Effect::StartCamera { epoch } => {
            inflight.spawn(async move {
                Resolution::CameraStarted {
                    epoch,
                    result: api.start_camera().await,
                }
            });
        }
        Effect::Capture { epoch, card } => {
            inflight.spawn(async move {
                Resolution::CaptureAccepted {
                    epoch,
                    result: api.capture_image(&card).await,
                }
            });
        }
        Effect::ReleaseCamera => {
            inflight.spawn(async move { Resolution::CameraReleased(api.stop_camera().await) });
        }
    }
}

async fn run_controller(
    api: Arc<dyn KioskApi>,
    mut commands: mpsc::Receiver<ControlMessage>,
    mut events: broadcast::Receiver<ServerEvent>,
    mut frames: watch::Receiver<Option<CameraFrame>>,
    snapshots: watch::Sender<BindingSnapshot>,
) {
    let mut machine = BindingMachine::new();
    let mut inflight = JoinSet::new();
    let mut events_open = true;
    let mut frames_open = true;

    perform(&api, &mut inflight, Effect::FetchPool);

    loop {
        let mut pending_reply = None;
        let effects = tokio::select! {
            msg = commands.recv() => {
                let Some(ControlMessage { action, reply }) = msg else {
                    break;
                };
                let action_name = action.name();
                match machine.apply(action) {
                    Ok(effects) => {
                        pending_reply = Some((reply, Ok(())));
                        effects
                    }
                    Err(rejected) => {
                        debug!(action = action_name, %rejected, "binding action rejected");
                        pending_reply = Some((reply, Err(rejected)));
                        Vec::new()
                    }
                }
            }
            Some(joined) = inflight.join_next() => match joined {
                Ok(resolution) => machine.resolve(resolution),
                Err(err) => {
                    warn!(%err, "binding request task failed");
                    Vec::new()
                }
            },
            event = events.recv(), if events_open => match event {
                Ok(event) => machine.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "binding controller lagged behind live events");
                    Vec::new()
                }
                Err(broadcast::error::RecvError::Closed) => {
                    events_open = false;
                    Vec::new()
                }
            },
            changed = frames.changed(), if frames_open => {
                match changed {
                    Ok(()) => {
                        if let Some(frame) = frames.borrow_and_update().clone() {
                            machine.on_frame(frame);
                        }
                    }
                    Err(_) => frames_open = false,
                }
                Vec::new()
            }
        };

        for effect in effects {
            perform(&api, &mut inflight, effect);
        }
        snapshots.send_if_modified(|current| {
            if current != machine.snapshot() {
                *current = machine.snapshot().clone();
                true
            } else {
                false
            }
        });
        // Reply only once the new snapshot is visible to the caller.
        if let Some((reply, result)) = pending_reply {
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
#[path = "tests/binding_tests.rs"]
mod tests;
