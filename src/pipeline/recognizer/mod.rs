pub mod common;
pub mod ort;
pub mod palm;

use std::{sync::Arc, thread, time::Duration, time::Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::{
    dispatch::ClassificationDispatcher,
    history::{GestureHistory, PointHistory},
    normalize::normalize,
    rate_limit::RateLimiter,
};
use crate::{
    diagnostics::{Counter, PipelineStats},
    display::{DisplayBoard, GestureOrigin},
    error::PipelineError,
    gesture::{ClassifierInput, ClassifierMode},
    stream::OutboundEvent,
    types::{Frame, LandmarkFrame, RecognizedGesture},
};

pub use self::ort::{DetectorSettings, OrtHandDetector};

/// Finds hands in a frame. An empty result means no hand was seen.
pub trait HandDetector: Send + 'static {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<LandmarkFrame>>;
}

#[derive(Clone, Debug)]
pub struct RecognitionSettings {
    pub history_len: usize,
    pub throttle_interval: Duration,
    /// Publish the history's most common id instead of the raw one.
    pub emit_smoothed: bool,
}

#[derive(Debug)]
pub enum HandOutcome {
    Published(RecognizedGesture),
    Throttled(RecognizedGesture),
    Failed(PipelineError),
}

#[derive(Debug)]
pub enum CycleOutcome {
    NoHands,
    DetectFailed(PipelineError),
    Hands(Vec<HandOutcome>),
}

/// Detect, normalize, classify, smooth and rate-limit one frame at a time.
///
/// Owns the history buffers for the lifetime of a capture session. Each hand
/// slot (position in detection order) keeps its own fingertip trajectory.
pub struct RecognitionStage {
    detector: Box<dyn HandDetector>,
    dispatcher: ClassificationDispatcher,
    gestures: GestureHistory,
    points: Vec<PointHistory>,
    history_len: usize,
    limiter: RateLimiter,
    emit_smoothed: bool,
    outbound: Sender<OutboundEvent>,
    display: DisplayBoard,
    stats: Arc<PipelineStats>,
}

impl RecognitionStage {
    pub fn new(
        detector: Box<dyn HandDetector>,
        dispatcher: ClassificationDispatcher,
        settings: &RecognitionSettings,
        outbound: Sender<OutboundEvent>,
        display: DisplayBoard,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            detector,
            dispatcher,
            gestures: GestureHistory::new(settings.history_len),
            points: Vec::new(),
            history_len: settings.history_len,
            limiter: RateLimiter::new(settings.throttle_interval),
            emit_smoothed: settings.emit_smoothed,
            outbound,
            display,
            stats,
        }
    }

    #[cfg(test)]
    pub fn gestures(&self) -> &GestureHistory {
        &self.gestures
    }

    pub fn process(&mut self, frame: &Frame, now: Instant) -> CycleOutcome {
        let hands = match self.detector.detect(frame) {
            Ok(hands) => hands,
            Err(err) => {
                let message = format!("{err:#}");
                self.stats
                    .record_fault(Counter::DetectorFailures, message.clone());
                return CycleOutcome::DetectFailed(PipelineError::Detector(message));
            }
        };

        if hands.is_empty() {
            return CycleOutcome::NoHands;
        }

        let outcomes = hands
            .iter()
            .enumerate()
            .map(|(slot, hand)| self.process_hand(slot, hand, frame, now))
            .collect();
        CycleOutcome::Hands(outcomes)
    }

    fn slot_history(&mut self, slot: usize) -> &mut PointHistory {
        while self.points.len() <= slot {
            self.points.push(PointHistory::new(self.history_len));
        }
        &mut self.points[slot]
    }

    fn process_hand(
        &mut self,
        slot: usize,
        hand: &LandmarkFrame,
        frame: &Frame,
        now: Instant,
    ) -> HandOutcome {
        self.stats.incr(Counter::HandsDetected);

        let shape = normalize(hand);
        if shape.is_degenerate() {
            self.stats.incr(Counter::DegenerateFrames);
        }

        let mode = self.dispatcher.mode();
        let points = self.slot_history(slot);
        points.push(hand.trajectory_point());
        let trajectory = match mode {
            ClassifierMode::Trajectory => points.features(frame.width, frame.height),
            ClassifierMode::Static => Vec::new(),
        };

        let classification = match self.dispatcher.classify(&ClassifierInput {
            shape: &shape,
            trajectory: &trajectory,
        }) {
            Ok(classification) => classification,
            Err(err) => return HandOutcome::Failed(err),
        };

        self.gestures.push(classification.id);
        let smoothed_id = self.gestures.smoothed().unwrap_or(classification.id);
        self.display
            .show_gesture(&classification.label, GestureOrigin::Local);

        let gesture = RecognizedGesture {
            classification,
            smoothed_id,
            timestamp: frame.timestamp,
        };

        if self.limiter.should_throttle(now) {
            log::debug!(
                "throttled {} ({:?} until next emission)",
                gesture.classification.label,
                self.limiter.remaining_at(now)
            );
            self.stats.incr(Counter::GesturesThrottled);
            return HandOutcome::Throttled(gesture);
        }

        let id = if self.emit_smoothed {
            gesture.smoothed_id
        } else {
            gesture.classification.id
        };
        match self.outbound.try_send(OutboundEvent::HandSign { id }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats
                    .record_fault(Counter::OutboundDropped, "gesture queue full");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats
                    .record_fault(Counter::OutboundDropped, "emit stage gone");
            }
        }
        HandOutcome::Published(gesture)
    }
}

/// Blocks for the next frame, then skips ahead to the newest queued one.
pub fn recv_latest_frame(frame_rx: &Receiver<Frame>) -> Option<Frame> {
    let mut frame = frame_rx.recv().ok()?;
    while let Ok(newer) = frame_rx.try_recv() {
        frame = newer;
    }
    Some(frame)
}

pub fn run_worker_loop(mut stage: RecognitionStage, frame_rx: Receiver<Frame>) {
    while let Some(frame) = recv_latest_frame(&frame_rx) {
        let outcomes = match stage.process(&frame, Instant::now()) {
            CycleOutcome::NoHands => continue,
            CycleOutcome::DetectFailed(err) => {
                log::warn!("{err}");
                continue;
            }
            CycleOutcome::Hands(outcomes) => outcomes,
        };
        for (slot, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                HandOutcome::Published(gesture) => log::debug!(
                    "published {} (hand {slot}, id {}, smoothed {}, {:?} after capture)",
                    gesture.display_text(),
                    gesture.classification.id,
                    gesture.smoothed_id,
                    gesture.timestamp.elapsed()
                ),
                HandOutcome::Throttled(gesture) => log::trace!(
                    "throttled {} (hand {slot}{})",
                    gesture.display_text(),
                    if gesture.classification.resolved { "" } else { ", no label entry" }
                ),
                HandOutcome::Failed(err) => log::warn!("skipped hand {slot}: {err}"),
            }
        }
    }
}

pub fn start_recognizer(
    stage: RecognitionStage,
    frame_rx: Receiver<Frame>,
) -> thread::JoinHandle<()> {
    log::info!(
        "starting recognition stage ({} classifier)",
        stage.dispatcher.mode().label()
    );
    thread::spawn(move || {
        run_worker_loop(stage, frame_rx);
        log::debug!("recognition stage finished");
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use anyhow::anyhow;

    use super::*;
    use crate::gesture::StaticGestureClassifier;
    use crate::types::{GestureId, LandmarkPoint, NUM_LANDMARKS, NormalizedVector};

    pub fn open_hand() -> LandmarkFrame {
        LandmarkFrame::new(
            (0..NUM_LANDMARKS as i32)
                .map(|i| LandmarkPoint::new(100 + i * 3, 200 - i * 5))
                .collect(),
        )
    }

    /// Returns the scripted hands for each frame, then no hands.
    pub struct ScriptedDetector {
        pub script: VecDeque<anyhow::Result<Vec<LandmarkFrame>>>,
    }

    impl ScriptedDetector {
        pub fn always_one_hand(frames: usize) -> Self {
            Self {
                script: (0..frames).map(|_| Ok(vec![open_hand()])).collect(),
            }
        }
    }

    impl HandDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<LandmarkFrame>> {
            self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    pub struct FixedClassifier {
        pub ids: VecDeque<GestureId>,
    }

    impl StaticGestureClassifier for FixedClassifier {
        fn classify(&mut self, _vector: &NormalizedVector) -> anyhow::Result<GestureId> {
            self.ids.pop_front().ok_or_else(|| anyhow!("classifier exhausted"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, fs, path::Path};

    use anyhow::anyhow;
    use crossbeam_channel::{bounded, unbounded};
    use tempfile::tempdir;

    use super::testing::*;
    use super::*;
    use crate::{
        gesture::{ClassifierVariant, TemporalGestureClassifier},
        gloss_log::GlossLog,
        labels::LabelSource,
        types::{GestureId, LandmarkPoint},
    };

    fn stage_with(
        dir: &Path,
        detector: ScriptedDetector,
        ids: Vec<GestureId>,
        emit_smoothed: bool,
        outbound: Sender<OutboundEvent>,
    ) -> (RecognitionStage, Arc<PipelineStats>, DisplayBoard) {
        let labels = dir.join("labels.json");
        fs::write(&labels, r#"{"1":"hello","2":"thanks","3":"yes"}"#).unwrap();
        let stats = Arc::new(PipelineStats::new());
        let display = DisplayBoard::new();
        let dispatcher = ClassificationDispatcher::new(
            ClassifierVariant::Static(Box::new(FixedClassifier {
                ids: ids.into_iter().collect(),
            })),
            LabelSource::new(labels),
            GlossLog::new(dir.join("gloss.txt")),
            stats.clone(),
        );
        let settings = RecognitionSettings {
            history_len: 16,
            throttle_interval: Duration::from_secs(1),
            emit_smoothed,
        };
        let stage = RecognitionStage::new(
            Box::new(detector),
            dispatcher,
            &settings,
            outbound,
            display.clone(),
            stats.clone(),
        );
        (stage, stats, display)
    }

    fn frame() -> Frame {
        Frame::new(vec![0; 640 * 480 * 4], 640, 480)
    }

    #[test]
    fn two_classifications_within_interval_publish_once_and_log_twice() {
        let dir = tempdir().unwrap();
        let (tx, rx) = unbounded();
        let (mut stage, stats, display) =
            stage_with(dir.path(), ScriptedDetector::always_one_hand(2), vec![0, 1], false, tx);

        let t0 = Instant::now();
        let first = stage.process(&frame(), t0);
        let second = stage.process(&frame(), t0 + Duration::from_millis(300));

        assert!(matches!(
            first,
            CycleOutcome::Hands(ref o) if matches!(o.as_slice(), [HandOutcome::Published(_)])
        ));
        assert!(matches!(
            second,
            CycleOutcome::Hands(ref o) if matches!(o.as_slice(), [HandOutcome::Throttled(_)])
        ));

        let published: Vec<_> = rx.try_iter().collect();
        assert_eq!(published, vec![OutboundEvent::HandSign { id: 0 }]);

        let log = fs::read_to_string(dir.path().join("gloss.txt")).unwrap();
        assert_eq!(log, "hello\nthanks\n");
        assert_eq!(stats.get(Counter::GesturesThrottled), 1);
        assert_eq!(display.text().as_deref(), Some("Hand Sign: thanks"));
    }

    #[test]
    fn emission_resumes_after_interval() {
        let dir = tempdir().unwrap();
        let (tx, rx) = unbounded();
        let (mut stage, _stats, _display) =
            stage_with(dir.path(), ScriptedDetector::always_one_hand(2), vec![2, 1], false, tx);

        let t0 = Instant::now();
        stage.process(&frame(), t0);
        stage.process(&frame(), t0 + Duration::from_millis(1_000));

        let published: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            published,
            vec![
                OutboundEvent::HandSign { id: 2 },
                OutboundEvent::HandSign { id: 1 }
            ]
        );
    }

    #[test]
    fn smoothed_emission_uses_majority() {
        let dir = tempdir().unwrap();
        let (tx, rx) = unbounded();
        let (mut stage, _stats, _display) =
            stage_with(dir.path(), ScriptedDetector::always_one_hand(4), vec![1, 1, 2, 2], true, tx);

        let t0 = Instant::now();
        for step in 0..3 {
            stage.process(&frame(), t0 + Duration::from_millis(100 * step));
        }
        // the fourth id ties the window 2:2 and the first-seen id wins
        stage.process(&frame(), t0 + Duration::from_secs(2));

        let published: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            published,
            vec![
                OutboundEvent::HandSign { id: 1 },
                OutboundEvent::HandSign { id: 1 }
            ]
        );
        assert_eq!(stage.gestures().most_common(), vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn no_hands_skips_classification() {
        let dir = tempdir().unwrap();
        let (tx, rx) = unbounded();
        let (mut stage, stats, _display) =
            stage_with(dir.path(), ScriptedDetector::always_one_hand(0), vec![0], false, tx);

        assert!(matches!(
            stage.process(&frame(), Instant::now()),
            CycleOutcome::NoHands
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.get(Counter::Classifications), 0);
        assert!(!dir.path().join("gloss.txt").exists());
    }

    #[test]
    fn detector_failure_is_counted_and_skipped() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let detector = ScriptedDetector {
            script: VecDeque::from(vec![Err(anyhow!("tensor shape mismatch"))]),
        };
        let (mut stage, stats, _display) = stage_with(dir.path(), detector, vec![0], false, tx);

        assert!(matches!(
            stage.process(&frame(), Instant::now()),
            CycleOutcome::DetectFailed(PipelineError::Detector(_))
        ));
        assert_eq!(stats.get(Counter::DetectorFailures), 1);
    }

    #[test]
    fn every_hand_runs_in_detection_order() {
        let dir = tempdir().unwrap();
        let (tx, rx) = unbounded();
        let detector = ScriptedDetector {
            script: VecDeque::from(vec![Ok(vec![open_hand(), open_hand()])]),
        };
        let (mut stage, stats, _display) = stage_with(dir.path(), detector, vec![2, 0], false, tx);

        let CycleOutcome::Hands(outcomes) = stage.process(&frame(), Instant::now()) else {
            panic!("expected hands");
        };
        assert!(matches!(outcomes[0], HandOutcome::Published(_)));
        assert!(matches!(outcomes[1], HandOutcome::Throttled(_)));
        assert_eq!(rx.try_recv().unwrap(), OutboundEvent::HandSign { id: 2 });
        assert_eq!(stats.get(Counter::HandsDetected), 2);
        let log = fs::read_to_string(dir.path().join("gloss.txt")).unwrap();
        assert_eq!(log, "yes\nhello\n");
    }

    #[test]
    fn classifier_failure_skips_only_that_hand() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = unbounded();
        let (mut stage, stats, _display) =
            stage_with(dir.path(), ScriptedDetector::always_one_hand(1), vec![], false, tx);

        let CycleOutcome::Hands(outcomes) = stage.process(&frame(), Instant::now()) else {
            panic!("expected hands");
        };
        assert!(matches!(
            outcomes[0],
            HandOutcome::Failed(PipelineError::Classifier(_))
        ));
        assert_eq!(stats.get(Counter::ClassifierFailures), 1);
        assert!(stage.gestures().most_common().is_empty());
    }

    #[test]
    fn full_gesture_queue_is_counted() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = bounded(0);
        let (mut stage, stats, _display) =
            stage_with(dir.path(), ScriptedDetector::always_one_hand(1), vec![0], false, tx);

        stage.process(&frame(), Instant::now());
        assert_eq!(stats.get(Counter::OutboundDropped), 1);
    }

    struct RecordingTrajectory {
        seen: Arc<parking_lot::Mutex<Vec<Vec<f32>>>>,
    }

    impl TemporalGestureClassifier for RecordingTrajectory {
        fn classify(&mut self, trajectory: &[f32]) -> anyhow::Result<GestureId> {
            self.seen.lock().push(trajectory.to_vec());
            Ok(0)
        }
    }

    fn trajectory_stage(
        dir: &Path,
        detector: ScriptedDetector,
    ) -> (RecognitionStage, Arc<parking_lot::Mutex<Vec<Vec<f32>>>>) {
        let labels = dir.join("labels.json");
        fs::write(&labels, r#"{"1":"circle"}"#).unwrap();
        let stats = Arc::new(PipelineStats::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let dispatcher = ClassificationDispatcher::new(
            ClassifierVariant::Trajectory(Box::new(RecordingTrajectory { seen: seen.clone() })),
            LabelSource::new(labels),
            GlossLog::new(dir.join("gloss.txt")),
            stats.clone(),
        );
        let settings = RecognitionSettings {
            history_len: 16,
            throttle_interval: Duration::from_secs(1),
            emit_smoothed: false,
        };
        let (tx, _rx) = unbounded();
        let stage = RecognitionStage::new(
            Box::new(detector),
            dispatcher,
            &settings,
            tx,
            DisplayBoard::new(),
            stats,
        );
        (stage, seen)
    }

    fn shifted_hand(dx: i32) -> LandmarkFrame {
        LandmarkFrame::new(
            open_hand()
                .points
                .iter()
                .map(|p| LandmarkPoint::new(p.x + dx, p.y))
                .collect(),
        )
    }

    #[test]
    fn each_hand_keeps_its_own_trajectory() {
        let dir = tempdir().unwrap();
        let detector = ScriptedDetector {
            script: (0..2)
                .map(|_| Ok(vec![shifted_hand(0), shifted_hand(300)]))
                .collect(),
        };
        let (mut stage, seen) = trajectory_stage(dir.path(), detector);

        stage.process(&frame(), Instant::now());
        stage.process(&frame(), Instant::now());

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        // Both hands stay put, so no slot sees any displacement.
        assert!(seen.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn trajectory_mode_feeds_point_history() {
        let dir = tempdir().unwrap();
        let (mut stage, seen) =
            trajectory_stage(dir.path(), ScriptedDetector::always_one_hand(2));

        stage.process(&frame(), Instant::now());
        stage.process(&frame(), Instant::now());
        let lens: Vec<usize> = seen.lock().iter().map(Vec::len).collect();
        assert_eq!(lens, vec![32, 32]);
    }

    #[test]
    fn worker_takes_latest_frame_and_exits_on_disconnect() {
        let (tx, rx) = bounded(3);
        tx.send(Frame::new(vec![0; 4], 1, 1)).unwrap();
        tx.send(Frame::new(vec![0; 16], 2, 2)).unwrap();
        let latest = recv_latest_frame(&rx).unwrap();
        assert_eq!(latest.width, 2);
        drop(tx);
        assert!(recv_latest_frame(&rx).is_none());
    }
}
