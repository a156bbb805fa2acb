use std::collections::VecDeque;

use crate::types::{GestureId, LandmarkPoint};

pub const DEFAULT_HISTORY_LEN: usize = 16;

/// Fixed-capacity FIFO: pushing into a full buffer evicts the oldest entry.
#[derive(Clone, Debug)]
pub struct HistoryBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> HistoryBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

/// Sliding window over recent classifier ids, used for majority voting.
#[derive(Clone, Debug)]
pub struct GestureHistory {
    ids: HistoryBuffer<GestureId>,
}

impl GestureHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: HistoryBuffer::new(capacity),
        }
    }

    pub fn push(&mut self, id: GestureId) {
        self.ids.push(id);
    }

    /// Ids with their counts, most frequent first.
    ///
    /// Equal counts keep first-seen order: the id whose oldest surviving
    /// occurrence comes earlier in the window ranks higher.
    pub fn most_common(&self) -> Vec<(GestureId, usize)> {
        let mut counts: Vec<(GestureId, usize)> = Vec::new();
        for id in self.ids.iter() {
            match counts.iter_mut().find(|(seen, _)| seen == id) {
                Some((_, count)) => *count += 1,
                None => counts.push((*id, 1)),
            }
        }
        // Stable sort keeps first-seen order among ties.
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts
    }

    /// Majority-vote result for the current window.
    pub fn smoothed(&self) -> Option<GestureId> {
        self.most_common().first().map(|(id, _)| *id)
    }
}

impl Default for GestureHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

/// Recent trajectory samples, one per recognition cycle.
///
/// Only the trajectory classifier reads it; the static classifier path
/// records into it without consuming it.
#[derive(Clone, Debug)]
pub struct PointHistory {
    points: HistoryBuffer<LandmarkPoint>,
}

impl PointHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: HistoryBuffer::new(capacity),
        }
    }

    pub fn push(&mut self, point: LandmarkPoint) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn capacity(&self) -> usize {
        self.points.capacity()
    }

    /// Flattened features padded with the oldest sample until the window is
    /// full, so the trajectory model always sees `2 * capacity` values.
    pub fn features(&self, width: u32, height: u32) -> Vec<f32> {
        let missing = self.capacity() - self.len();
        let mut window: Vec<LandmarkPoint> = self
            .points
            .iter()
            .next()
            .map(|oldest| vec![*oldest; missing])
            .unwrap_or_default();
        window.extend(self.points.iter().copied());
        let mut features = super::normalize::trajectory_features(&window, width, height);
        features.resize(self.capacity() * 2, 0.0);
        features
    }
}

impl Default for PointHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}
