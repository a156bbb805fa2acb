pub mod codec;
pub mod polling;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use crossbeam_channel::{Receiver, TryRecvError, select};
use serde_json::{Value, json};

use crate::{
    diagnostics::{Counter, PipelineStats},
    error::StreamError,
    types::GestureId,
};

pub const EVENT_VIDEO_FRAME: &str = "video_frame";
pub const EVENT_HAND_SIGN: &str = "hand_sign";
pub const EVENT_RECEIVE_HAND_SIGN: &str = "receive_hand_sign";
pub const EVENT_JOIN: &str = "join";
pub const EVENT_LEAVE: &str = "leave";

/// Something this client publishes to the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundEvent {
    /// JPEG-encoded camera frame.
    VideoFrame(Vec<u8>),
    HandSign { id: GestureId },
    Join { username: String },
    Leave { username: String },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::VideoFrame(_) => EVENT_VIDEO_FRAME,
            OutboundEvent::HandSign { .. } => EVENT_HAND_SIGN,
            OutboundEvent::Join { .. } => EVENT_JOIN,
            OutboundEvent::Leave { .. } => EVENT_LEAVE,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::VideoFrame(jpeg) => Value::String(STANDARD.encode(jpeg)),
            OutboundEvent::HandSign { id } => json!({ "hand_sign": id.to_string() }),
            OutboundEvent::Join { username } | OutboundEvent::Leave { username } => {
                json!({ "username": username })
            }
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, OutboundEvent::VideoFrame(_))
    }
}

/// Something the relay broadcast to us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    HandSign(String),
    Other(String),
}

impl InboundEvent {
    pub fn from_event(name: &str, args: &[Value]) -> Self {
        match name {
            EVENT_HAND_SIGN | EVENT_RECEIVE_HAND_SIGN => {
                let label = args.first().and_then(|payload| match payload {
                    Value::Object(map) => map.get("hand_sign").map(value_to_label),
                    Value::String(label) => Some(label.clone()),
                    _ => None,
                });
                match label {
                    Some(label) => InboundEvent::HandSign(label),
                    None => InboundEvent::Other(name.to_string()),
                }
            }
            other => InboundEvent::Other(other.to_string()),
        }
    }
}

fn value_to_label(value: &Value) -> String {
    match value {
        Value::String(label) => label.clone(),
        other => other.to_string(),
    }
}

/// Publishing half of a relay connection.
pub trait EventSink: Send {
    fn emit(&mut self, name: &str, payload: &Value) -> Result<(), StreamError>;

    fn close(&mut self) -> Result<(), StreamError> {
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn emit(&mut self, name: &str, payload: &Value) -> Result<(), StreamError> {
        (**self).emit(name, payload)
    }

    fn close(&mut self) -> Result<(), StreamError> {
        (**self).close()
    }
}

/// Subscribing half of a relay connection. `poll` blocks until the relay has
/// something to deliver or its long-poll window ends.
pub trait EventSource: Send {
    fn poll(&mut self) -> Result<Vec<(String, Vec<Value>)>, StreamError>;
}

impl<S: EventSource + ?Sized> EventSource for Box<S> {
    fn poll(&mut self) -> Result<Vec<(String, Vec<Value>)>, StreamError> {
        (**self).poll()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2,
            max_backoff: Duration::from_secs(2),
        }
    }
}

pub struct StreamingClient<S: EventSink> {
    sink: S,
    retry: RetryPolicy,
    stats: Arc<PipelineStats>,
}

impl<S: EventSink> StreamingClient<S> {
    pub fn new(sink: S, retry: RetryPolicy, stats: Arc<PipelineStats>) -> Self {
        Self { sink, retry, stats }
    }

    pub fn publish_frame(&mut self, jpeg: Vec<u8>) -> Result<(), StreamError> {
        self.publish(&OutboundEvent::VideoFrame(jpeg))
    }

    pub fn publish_gesture(&mut self, id: GestureId) -> Result<(), StreamError> {
        self.publish(&OutboundEvent::HandSign { id })
    }

    pub fn join(&mut self, username: &str) -> Result<(), StreamError> {
        self.publish(&OutboundEvent::Join {
            username: username.to_string(),
        })
    }

    pub fn leave(&mut self, username: &str) -> Result<(), StreamError> {
        self.publish(&OutboundEvent::Leave {
            username: username.to_string(),
        })
    }

    /// Routes a queued event to its publish operation.
    pub fn send(&mut self, event: OutboundEvent) -> Result<(), StreamError> {
        match event {
            OutboundEvent::VideoFrame(jpeg) => self.publish_frame(jpeg),
            OutboundEvent::HandSign { id } => self.publish_gesture(id),
            OutboundEvent::Join { username } => self.join(&username),
            OutboundEvent::Leave { username } => self.leave(&username),
        }
    }

    /// Sends one event. Frames get a single attempt; everything else is
    /// retried on transient faults according to the retry policy.
    fn publish(&mut self, event: &OutboundEvent) -> Result<(), StreamError> {
        let policy = if event.is_frame() {
            RetryPolicy::once()
        } else {
            self.retry.clone()
        };
        let payload = event.payload();
        let mut attempt = 1;

        loop {
            match self.sink.emit(event.name(), &payload) {
                Ok(()) => {
                    match event {
                        OutboundEvent::VideoFrame(_) => self.stats.incr(Counter::FramesPublished),
                        OutboundEvent::HandSign { .. } => {
                            self.stats.incr(Counter::GesturesPublished)
                        }
                        OutboundEvent::Join { .. } | OutboundEvent::Leave { .. } => {
                            log::info!("sent {} to relay", event.name())
                        }
                    }
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    log::debug!(
                        "{} attempt {attempt} failed ({err}), retrying in {delay:?}",
                        event.name()
                    );
                    self.stats.incr(Counter::PublishRetries);
                    attempt += 1;
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => {
                    let counter = if event.is_frame() {
                        Counter::FramePublishFailures
                    } else {
                        Counter::PublishFailures
                    };
                    log::warn!("failed to publish {}: {err}", event.name());
                    self.stats
                        .record_fault(counter, format!("{}: {err}", event.name()));
                    return Err(err);
                }
            }
        }
    }

    pub fn close(&mut self) {
        if let Err(err) = self.sink.close() {
            log::debug!("closing relay session failed: {err}");
        }
    }
}

#[derive(Clone, Copy)]
enum Lane {
    Gesture,
    Frame,
}

/// Emit stage: drains the gesture and frame queues into the relay, gestures
/// first. Returns once both queues are disconnected and empty.
pub fn run_emitter<S: EventSink>(
    client: &mut StreamingClient<S>,
    gesture_rx: &Receiver<OutboundEvent>,
    frame_rx: &Receiver<OutboundEvent>,
) {
    let mut gestures_open = true;
    let mut frames_open = true;

    while gestures_open || frames_open {
        if gestures_open {
            match gesture_rx.try_recv() {
                Ok(event) => {
                    let _ = client.send(event);
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    gestures_open = false;
                    continue;
                }
                Err(TryRecvError::Empty) => {}
            }
        }

        let (lane, next) = if gestures_open && frames_open {
            select! {
                recv(gesture_rx) -> msg => (Lane::Gesture, msg.ok()),
                recv(frame_rx) -> msg => (Lane::Frame, msg.ok()),
            }
        } else if gestures_open {
            (Lane::Gesture, gesture_rx.recv().ok())
        } else {
            (Lane::Frame, frame_rx.recv().ok())
        };

        match (lane, next) {
            (_, Some(event)) => {
                let _ = client.send(event);
            }
            (Lane::Gesture, None) => gestures_open = false,
            (Lane::Frame, None) => frames_open = false,
        }
    }
}

/// Runs the emit stage on its own thread and hands the client back once
/// both queues are drained.
pub fn start_emitter<S: EventSink + 'static>(
    mut client: StreamingClient<S>,
    gesture_rx: Receiver<OutboundEvent>,
    frame_rx: Receiver<OutboundEvent>,
) -> thread::JoinHandle<StreamingClient<S>> {
    thread::spawn(move || {
        run_emitter(&mut client, &gesture_rx, &frame_rx);
        log::debug!("emit stage finished");
        client
    })
}

pub type BroadcastHandler = Box<dyn FnMut(&str) + Send>;

/// Receive stage: long-polls the relay and hands broadcast gesture labels to
/// the registered handlers unchanged.
pub struct BroadcastReceiver<S: EventSource> {
    source: S,
    handlers: Vec<BroadcastHandler>,
    stats: Arc<PipelineStats>,
    error_backoff: Duration,
}

impl<S: EventSource> BroadcastReceiver<S> {
    pub fn new(source: S, stats: Arc<PipelineStats>) -> Self {
        Self {
            source,
            handlers: Vec::new(),
            stats,
            error_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn on_broadcast_gesture(&mut self, handler: BroadcastHandler) {
        self.handlers.push(handler);
    }

    /// Polls once and returns how many broadcast gestures were dispatched.
    pub fn poll_once(&mut self) -> Result<usize, StreamError> {
        let mut dispatched = 0;
        for (name, args) in self.source.poll()? {
            match InboundEvent::from_event(&name, &args) {
                InboundEvent::HandSign(label) => {
                    self.stats.incr(Counter::BroadcastsReceived);
                    for handler in &mut self.handlers {
                        handler(&label);
                    }
                    dispatched += 1;
                }
                InboundEvent::Other(name) => log::trace!("ignoring relay event {name}"),
            }
        }
        Ok(dispatched)
    }

    /// Polls until `stop` is set or the relay closes the session.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.poll_once() {
                Ok(_) => {}
                Err(StreamError::Closed) => {
                    if !stop.load(Ordering::Relaxed) {
                        log::error!("relay closed the session; no longer receiving broadcasts");
                        self.stats
                            .record_fault(Counter::ReceiveFailures, "relay session closed");
                    }
                    break;
                }
                Err(err) => {
                    log::warn!("relay poll failed: {err}");
                    self.stats
                        .record_fault(Counter::ReceiveFailures, format!("poll: {err}"));
                    thread::sleep(self.error_backoff);
                }
            }
        }
    }
}

pub fn start_receiver<S: EventSource + 'static>(
    mut receiver: BroadcastReceiver<S>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        receiver.run(&stop);
        log::debug!("receive stage finished");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use crossbeam_channel::{bounded, unbounded};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(String, Value)>>>,
        failures: Arc<Mutex<VecDeque<StreamError>>>,
        closed: Arc<AtomicBool>,
    }

    impl RecordingSink {
        fn fail_next(&self, err: StreamError) {
            self.failures.lock().push_back(err);
        }

        fn names(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(n, _)| n.clone()).collect()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&mut self, name: &str, payload: &Value) -> Result<(), StreamError> {
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.sent.lock().push((name.to_string(), payload.clone()));
            Ok(())
        }

        fn close(&mut self) -> Result<(), StreamError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedSource {
        batches: VecDeque<Result<Vec<(String, Vec<Value>)>, StreamError>>,
    }

    impl EventSource for ScriptedSource {
        fn poll(&mut self) -> Result<Vec<(String, Vec<Value>)>, StreamError> {
            self.batches.pop_front().unwrap_or(Err(StreamError::Closed))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            multiplier: 2,
            max_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn payloads_match_relay_contract() {
        assert_eq!(
            OutboundEvent::HandSign { id: 4 }.payload(),
            json!({"hand_sign": "4"})
        );
        assert_eq!(
            OutboundEvent::VideoFrame(vec![0xff, 0xd8, 0xff]).payload(),
            json!("/9j/")
        );
        assert_eq!(
            OutboundEvent::Join {
                username: "kim".into()
            }
            .payload(),
            json!({"username": "kim"})
        );
        assert_eq!(
            OutboundEvent::Leave {
                username: "kim".into()
            }
            .name(),
            "leave"
        );
    }

    #[test]
    fn inbound_accepts_both_broadcast_names() {
        assert_eq!(
            InboundEvent::from_event("hand_sign", &[json!({"hand_sign": "hello"})]),
            InboundEvent::HandSign("hello".into())
        );
        assert_eq!(
            InboundEvent::from_event("receive_hand_sign", &[json!({"hand_sign": "thanks"})]),
            InboundEvent::HandSign("thanks".into())
        );
        assert_eq!(
            InboundEvent::from_event("hand_sign", &[json!({"other": 1})]),
            InboundEvent::Other("hand_sign".into())
        );
        assert_eq!(
            InboundEvent::from_event("chat", &[json!("hi")]),
            InboundEvent::Other("chat".into())
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_secs(2));
    }

    #[test]
    fn gestures_are_retried_until_success() {
        let sink = RecordingSink::default();
        sink.fail_next(StreamError::Status(503));
        sink.fail_next(StreamError::Status(502));
        let stats = Arc::new(PipelineStats::new());
        let mut client = StreamingClient::new(sink.clone(), fast_retry(), stats.clone());

        client.publish_gesture(2).unwrap();

        assert_eq!(sink.names(), vec!["hand_sign"]);
        assert_eq!(stats.get(Counter::PublishRetries), 2);
        assert_eq!(stats.get(Counter::GesturesPublished), 1);
        assert_eq!(stats.get(Counter::PublishFailures), 0);
    }

    #[test]
    fn retries_are_bounded() {
        let sink = RecordingSink::default();
        for _ in 0..5 {
            sink.fail_next(StreamError::Status(500));
        }
        let stats = Arc::new(PipelineStats::new());
        let mut client = StreamingClient::new(sink.clone(), fast_retry(), stats.clone());

        assert!(client.publish_gesture(1).is_err());
        assert_eq!(stats.get(Counter::PublishRetries), 2);
        assert_eq!(stats.get(Counter::PublishFailures), 1);
        // two queued failures remain: exactly three attempts were made
        assert_eq!(sink.failures.lock().len(), 2);
    }

    #[test]
    fn permanent_faults_are_not_retried() {
        let sink = RecordingSink::default();
        sink.fail_next(StreamError::Closed);
        let stats = Arc::new(PipelineStats::new());
        let mut client = StreamingClient::new(sink.clone(), fast_retry(), stats.clone());

        assert!(matches!(client.join("kim"), Err(StreamError::Closed)));
        assert_eq!(stats.get(Counter::PublishRetries), 0);
        assert_eq!(stats.get(Counter::PublishFailures), 1);
    }

    #[test]
    fn frames_are_sent_once() {
        let sink = RecordingSink::default();
        sink.fail_next(StreamError::Status(503));
        let stats = Arc::new(PipelineStats::new());
        let mut client = StreamingClient::new(sink.clone(), fast_retry(), stats.clone());

        assert!(client.publish_frame(vec![1, 2, 3]).is_err());
        assert!(sink.names().is_empty());
        assert_eq!(stats.get(Counter::FramePublishFailures), 1);
        assert_eq!(stats.get(Counter::PublishFailures), 0);

        client.publish_frame(vec![1, 2, 3]).unwrap();
        assert_eq!(stats.get(Counter::FramesPublished), 1);
    }

    #[test]
    fn emitter_prefers_gestures_and_drains_everything() {
        let sink = RecordingSink::default();
        let stats = Arc::new(PipelineStats::new());
        let mut client = StreamingClient::new(sink.clone(), fast_retry(), stats);
        let (gesture_tx, gesture_rx) = unbounded();
        let (frame_tx, frame_rx) = bounded(4);

        frame_tx.send(OutboundEvent::VideoFrame(vec![1])).unwrap();
        frame_tx.send(OutboundEvent::VideoFrame(vec![2])).unwrap();
        gesture_tx.send(OutboundEvent::HandSign { id: 0 }).unwrap();
        gesture_tx.send(OutboundEvent::HandSign { id: 1 }).unwrap();
        drop(gesture_tx);
        drop(frame_tx);

        run_emitter(&mut client, &gesture_rx, &frame_rx);

        assert_eq!(
            sink.names(),
            vec!["hand_sign", "hand_sign", "video_frame", "video_frame"]
        );
    }

    #[test]
    fn emitter_thread_returns_client_after_draining() {
        let sink = RecordingSink::default();
        let stats = Arc::new(PipelineStats::new());
        let client = StreamingClient::new(sink.clone(), fast_retry(), stats);
        let (gesture_tx, gesture_rx) = unbounded();
        let (frame_tx, frame_rx) = bounded(1);

        let handle = start_emitter(client, gesture_rx, frame_rx);
        gesture_tx
            .send(OutboundEvent::Join {
                username: "kim".into(),
            })
            .unwrap();
        drop(gesture_tx);
        drop(frame_tx);
        let mut client = handle.join().unwrap();
        assert!(!sink.closed.load(Ordering::SeqCst));

        client.leave("kim").unwrap();
        client.close();
        assert_eq!(sink.names(), vec!["join", "leave"]);
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn broadcasts_reach_every_handler() {
        let source = ScriptedSource {
            batches: VecDeque::from(vec![Ok(vec![
                ("receive_hand_sign".to_string(), vec![json!({"hand_sign": "hello"})]),
                ("chat".to_string(), vec![json!("ignored")]),
                ("hand_sign".to_string(), vec![json!({"hand_sign": "bye"})]),
            ])]),
        };
        let stats = Arc::new(PipelineStats::new());
        let mut receiver = BroadcastReceiver::new(source, stats.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_a = seen.clone();
        let seen_b = seen.clone();
        receiver.on_broadcast_gesture(Box::new(move |label| seen_a.lock().push(format!("a:{label}"))));
        receiver.on_broadcast_gesture(Box::new(move |label| seen_b.lock().push(format!("b:{label}"))));

        assert_eq!(receiver.poll_once().unwrap(), 2);
        assert_eq!(
            *seen.lock(),
            vec!["a:hello", "b:hello", "a:bye", "b:bye"]
        );
        assert_eq!(stats.get(Counter::BroadcastsReceived), 2);
    }

    #[test]
    fn receiver_survives_transient_errors_and_stops_on_close() {
        let source = ScriptedSource {
            batches: VecDeque::from(vec![
                Err(StreamError::Status(502)),
                Ok(vec![("hand_sign".to_string(), vec![json!({"hand_sign": "yes"})])]),
                Err(StreamError::Closed),
            ]),
        };
        let stats = Arc::new(PipelineStats::new());
        let mut receiver =
            BroadcastReceiver::new(source, stats.clone()).with_error_backoff(Duration::ZERO);
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        receiver.on_broadcast_gesture(Box::new(move |_| *counter.lock() += 1));

        receiver.run(&AtomicBool::new(false));

        assert_eq!(*count.lock(), 1);
        assert_eq!(stats.get(Counter::ReceiveFailures), 2);
        assert_eq!(stats.get(Counter::PublishFailures), 0);
        assert_eq!(
            stats.last_fault().as_deref(),
            Some("relay session closed")
        );
    }
}
