use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;

use super::{
    camera::{CaptureEnd, CaptureSettings, CaptureStage, SourceOpener},
    dispatch::ClassificationDispatcher,
    recognizer::{HandDetector, RecognitionSettings, RecognitionStage, start_recognizer},
};
use crate::{
    diagnostics::{Counter, PipelineStats},
    display::{DisplayBoard, GestureOrigin},
    error::PipelineError,
    stream::{
        BroadcastReceiver, EventSink, EventSource, OutboundEvent, StreamingClient, start_emitter,
        start_receiver,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    /// Terminal. `fault` is set when a camera fault ended the session.
    Stopped { fault: Option<String> },
}

impl SessionState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionState::Stopped { .. })
    }
}

/// Shared, per-session state handed to every stage.
#[derive(Clone)]
pub struct SessionContext {
    pub username: Option<String>,
    pub stats: Arc<PipelineStats>,
    pub display: DisplayBoard,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub capture: CaptureSettings,
    pub recognition: RecognitionSettings,
    pub frame_queue: usize,
    pub gesture_queue: usize,
}

/// Both halves of a connected relay session.
pub struct RelayConnection {
    pub client: StreamingClient<Box<dyn EventSink>>,
    pub receiver: BroadcastReceiver<Box<dyn EventSource>>,
}

/// What the recognition thread needs besides the shared context.
pub struct RecognitionParts {
    pub detector: Box<dyn HandDetector>,
    pub dispatcher: ClassificationDispatcher,
}

/// The running pipeline: capture, recognition, emit and receive threads.
///
/// Dropping the session stops and joins every stage; the frame source is
/// released when the capture thread returns.
pub struct CaptureSession {
    context: SessionContext,
    state: Arc<Mutex<SessionState>>,
    stop: Arc<AtomicBool>,
    gesture_tx: Option<Sender<OutboundEvent>>,
    capture: Option<thread::JoinHandle<()>>,
    recognition: Option<thread::JoinHandle<()>>,
    emitter: Option<thread::JoinHandle<StreamingClient<Box<dyn EventSink>>>>,
    receiver: Option<thread::JoinHandle<()>>,
}

impl CaptureSession {
    /// Opens the frame source and starts every stage. A source that fails
    /// to open leaves the session `Stopped` with the fault; there is no retry.
    pub fn start(
        context: SessionContext,
        opener: SourceOpener,
        parts: RecognitionParts,
        relay: RelayConnection,
        settings: &SessionSettings,
    ) -> Self {
        let state = Arc::new(Mutex::new(SessionState::Idle));
        let stop = Arc::new(AtomicBool::new(false));

        let (gesture_tx, gesture_rx) = bounded(settings.gesture_queue.max(1));
        let (frame_out_tx, frame_out_rx) = bounded(settings.frame_queue.max(1));
        let (recog_tx, recog_rx) = bounded(1);
        let (opened_tx, opened_rx) = bounded::<Result<String, PipelineError>>(1);

        let capture = {
            let stop = stop.clone();
            let state = state.clone();
            let stats = context.stats.clone();
            let display = context.display.clone();
            let capture_settings = settings.capture.clone();
            thread::spawn(move || {
                let mut source = match opener() {
                    Ok(source) => {
                        let _ = opened_tx.send(Ok(source.describe()));
                        source
                    }
                    Err(err) => {
                        let _ = opened_tx.send(Err(PipelineError::Camera(format!("{err:#}"))));
                        return;
                    }
                };

                let stage = CaptureStage {
                    settings: &capture_settings,
                    frame_out: &frame_out_tx,
                    recog_tx: &recog_tx,
                    display: &display,
                    stats: &stats,
                };
                let end = stage.run(source.as_mut(), &stop);
                drop(source);

                let fault = match end {
                    CaptureEnd::Stopped => return,
                    CaptureEnd::Exhausted => {
                        log::info!("frame source exhausted");
                        None
                    }
                    CaptureEnd::Fault(err) => {
                        let message = err.to_string();
                        log::error!("capture stopped: {message}");
                        stats.record_fault(Counter::CameraFaults, message.clone());
                        Some(message)
                    }
                };
                *state.lock() = SessionState::Stopped { fault };
            })
        };

        let mut session = Self {
            context,
            state,
            stop,
            gesture_tx: None,
            capture: Some(capture),
            recognition: None,
            emitter: None,
            receiver: None,
        };

        let RelayConnection {
            mut client,
            mut receiver,
        } = relay;

        let opened = opened_rx
            .recv()
            .unwrap_or_else(|_| {
                Err(PipelineError::Camera(
                    "capture thread exited before opening".to_string(),
                ))
            });
        if let Err(err) = opened {
            let message = err.to_string();
            log::error!("failed to open frame source: {message}");
            session
                .context
                .stats
                .record_fault(Counter::CameraFaults, message.clone());
            *session.state.lock() = SessionState::Stopped {
                fault: Some(message),
            };
            session.join_capture();
            client.close();
            return session;
        }

        // Queued before the emitter starts, so it precedes every frame.
        if let Some(username) = &session.context.username {
            let _ = gesture_tx.try_send(OutboundEvent::Join {
                username: username.clone(),
            });
        }

        let stage = RecognitionStage::new(
            parts.detector,
            parts.dispatcher,
            &settings.recognition,
            gesture_tx.clone(),
            session.context.display.clone(),
            session.context.stats.clone(),
        );
        session.recognition = Some(start_recognizer(stage, recog_rx));
        session.emitter = Some(start_emitter(client, gesture_rx, frame_out_rx));

        let display = session.context.display.clone();
        receiver.on_broadcast_gesture(Box::new(move |label| {
            display.show_gesture(label, GestureOrigin::Remote)
        }));
        session.receiver = Some(start_receiver(receiver, session.stop.clone()));
        session.gesture_tx = Some(gesture_tx);

        {
            let mut state = session.state.lock();
            if *state == SessionState::Idle {
                *state = SessionState::Capturing;
            }
        }
        session
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn display(&self) -> &DisplayBoard {
        &self.context.display
    }

    fn join_capture(&mut self) {
        if let Some(handle) = self.capture.take() {
            let _ = handle.join();
        }
    }

    /// Stops every stage in pipeline order and waits for them. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.join_capture();
        if let Some(handle) = self.recognition.take() {
            let _ = handle.join();
        }

        // Last gesture sender: the emitter drains both queues and returns.
        self.gesture_tx = None;
        if let Some(handle) = self.emitter.take() {
            match handle.join() {
                Ok(mut client) => {
                    if let Some(username) = &self.context.username {
                        let _ = client.leave(username);
                    }
                    client.close();
                }
                Err(_) => log::error!("emit stage panicked"),
            }
        }
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }

        let mut state = self.state.lock();
        if !state.is_stopped() {
            *state = SessionState::Stopped { fault: None };
            log::info!("capture session stopped");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
