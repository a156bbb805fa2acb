use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;
use serde::Serialize;

/// Counters shared by every pipeline stage.
///
/// Faults that are recovered locally still land here so a session that
/// "worked" can be told apart from one that silently dropped half its output.
pub struct PipelineStats {
    started: Instant,
    camera_faults: AtomicU64,
    frames_captured: AtomicU64,
    frame_read_failures: AtomicU64,
    frames_dropped: AtomicU64,
    frames_published: AtomicU64,
    frame_publish_failures: AtomicU64,
    detector_failures: AtomicU64,
    hands_detected: AtomicU64,
    degenerate_frames: AtomicU64,
    classifications: AtomicU64,
    unknown_gestures: AtomicU64,
    classifier_failures: AtomicU64,
    label_table_failures: AtomicU64,
    gloss_log_failures: AtomicU64,
    gestures_throttled: AtomicU64,
    gestures_published: AtomicU64,
    publish_failures: AtomicU64,
    publish_retries: AtomicU64,
    outbound_dropped: AtomicU64,
    broadcasts_received: AtomicU64,
    receive_failures: AtomicU64,
    last_fault: Mutex<Option<String>>,
}

#[derive(Clone, Copy, Debug)]
pub enum Counter {
    CameraFaults,
    FramesCaptured,
    FrameReadFailures,
    FramesDropped,
    FramesPublished,
    FramePublishFailures,
    DetectorFailures,
    HandsDetected,
    DegenerateFrames,
    Classifications,
    UnknownGestures,
    ClassifierFailures,
    LabelTableFailures,
    GlossLogFailures,
    GesturesThrottled,
    GesturesPublished,
    PublishFailures,
    PublishRetries,
    OutboundDropped,
    BroadcastsReceived,
    ReceiveFailures,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub uptime_ms: u64,
    pub camera_faults: u64,
    pub frames_captured: u64,
    pub frame_read_failures: u64,
    pub frames_dropped: u64,
    pub frames_published: u64,
    pub frame_publish_failures: u64,
    pub detector_failures: u64,
    pub hands_detected: u64,
    pub degenerate_frames: u64,
    pub classifications: u64,
    pub unknown_gestures: u64,
    pub classifier_failures: u64,
    pub label_table_failures: u64,
    pub gloss_log_failures: u64,
    pub gestures_throttled: u64,
    pub gestures_published: u64,
    pub publish_failures: u64,
    pub publish_retries: u64,
    pub outbound_dropped: u64,
    pub broadcasts_received: u64,
    pub receive_failures: u64,
    pub last_fault: Option<String>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            camera_faults: AtomicU64::new(0),
            frames_captured: AtomicU64::new(0),
            frame_read_failures: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
            frame_publish_failures: AtomicU64::new(0),
            detector_failures: AtomicU64::new(0),
            hands_detected: AtomicU64::new(0),
            degenerate_frames: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
            unknown_gestures: AtomicU64::new(0),
            classifier_failures: AtomicU64::new(0),
            label_table_failures: AtomicU64::new(0),
            gloss_log_failures: AtomicU64::new(0),
            gestures_throttled: AtomicU64::new(0),
            gestures_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            outbound_dropped: AtomicU64::new(0),
            broadcasts_received: AtomicU64::new(0),
            receive_failures: AtomicU64::new(0),
            last_fault: Mutex::new(None),
        }
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::CameraFaults => &self.camera_faults,
            Counter::FramesCaptured => &self.frames_captured,
            Counter::FrameReadFailures => &self.frame_read_failures,
            Counter::FramesDropped => &self.frames_dropped,
            Counter::FramesPublished => &self.frames_published,
            Counter::FramePublishFailures => &self.frame_publish_failures,
            Counter::DetectorFailures => &self.detector_failures,
            Counter::HandsDetected => &self.hands_detected,
            Counter::DegenerateFrames => &self.degenerate_frames,
            Counter::Classifications => &self.classifications,
            Counter::UnknownGestures => &self.unknown_gestures,
            Counter::ClassifierFailures => &self.classifier_failures,
            Counter::LabelTableFailures => &self.label_table_failures,
            Counter::GlossLogFailures => &self.gloss_log_failures,
            Counter::GesturesThrottled => &self.gestures_throttled,
            Counter::GesturesPublished => &self.gestures_published,
            Counter::PublishFailures => &self.publish_failures,
            Counter::PublishRetries => &self.publish_retries,
            Counter::OutboundDropped => &self.outbound_dropped,
            Counter::BroadcastsReceived => &self.broadcasts_received,
            Counter::ReceiveFailures => &self.receive_failures,
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Counts the fault and remembers its message as the latest one.
    pub fn record_fault(&self, counter: Counter, message: impl Into<String>) {
        self.incr(counter);
        *self.last_fault.lock() = Some(message.into());
    }

    pub fn last_fault(&self) -> Option<String> {
        self.last_fault.lock().clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_ms: self.started.elapsed().as_millis() as u64,
            camera_faults: self.get(Counter::CameraFaults),
            frames_captured: self.get(Counter::FramesCaptured),
            frame_read_failures: self.get(Counter::FrameReadFailures),
            frames_dropped: self.get(Counter::FramesDropped),
            frames_published: self.get(Counter::FramesPublished),
            frame_publish_failures: self.get(Counter::FramePublishFailures),
            detector_failures: self.get(Counter::DetectorFailures),
            hands_detected: self.get(Counter::HandsDetected),
            degenerate_frames: self.get(Counter::DegenerateFrames),
            classifications: self.get(Counter::Classifications),
            unknown_gestures: self.get(Counter::UnknownGestures),
            classifier_failures: self.get(Counter::ClassifierFailures),
            label_table_failures: self.get(Counter::LabelTableFailures),
            gloss_log_failures: self.get(Counter::GlossLogFailures),
            gestures_throttled: self.get(Counter::GesturesThrottled),
            gestures_published: self.get(Counter::GesturesPublished),
            publish_failures: self.get(Counter::PublishFailures),
            publish_retries: self.get(Counter::PublishRetries),
            outbound_dropped: self.get(Counter::OutboundDropped),
            broadcasts_received: self.get(Counter::BroadcastsReceived),
            receive_failures: self.get(Counter::ReceiveFailures),
            last_fault: self.last_fault(),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let stats = PipelineStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 0);
        assert_eq!(snap.publish_failures, 0);
        assert_eq!(snap.last_fault, None);
    }

    #[test]
    fn counters_are_independent() {
        let stats = PipelineStats::new();
        stats.incr(Counter::FramesCaptured);
        stats.incr(Counter::FramesCaptured);
        stats.incr(Counter::GesturesThrottled);
        assert_eq!(stats.get(Counter::FramesCaptured), 2);
        assert_eq!(stats.get(Counter::GesturesThrottled), 1);
        assert_eq!(stats.get(Counter::GesturesPublished), 0);
    }

    #[test]
    fn faults_keep_latest_message() {
        let stats = PipelineStats::new();
        stats.record_fault(Counter::PublishFailures, "timeout");
        stats.record_fault(Counter::GlossLogFailures, "disk full");
        let snap = stats.snapshot();
        assert_eq!(snap.publish_failures, 1);
        assert_eq!(snap.gloss_log_failures, 1);
        assert_eq!(snap.last_fault.as_deref(), Some("disk full"));
    }

    #[test]
    fn snapshot_serialises_camel_case() {
        let stats = PipelineStats::new();
        stats.incr(Counter::FramesDropped);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["framesDropped"], 1);
        assert!(json.get("lastFault").is_some());
    }
}
