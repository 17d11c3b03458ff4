//! Turning look-ahead statistics into hints for the final pass.
use std::collections::VecDeque;

use log::trace;

use crate::memory::{LookAheadMeta, PassHints};

/// Consumes the statistics of a look-ahead pass and produces the hints
/// attached to frames before they enter the next pass.
///
/// The encoder creates one manager per run and owns it for the whole run.
pub trait TwoPassManager: Send {
    /// Statistics of a frame that just left the look-ahead pass.
    fn add_frame(&mut self, stats: &LookAheadMeta);
    /// Hints for the oldest frame of `window`, the frames currently waiting
    /// in the look-ahead FIFO, oldest first.
    fn hints(&mut self, window: &[LookAheadMeta]) -> PassHints;
    /// The stream ended. State accumulated so far can be discarded.
    fn flush(&mut self);
}

/// Creates the manager used by each run of an encoder.
pub type ManagerFactory = Box<dyn Fn() -> Box<dyn TwoPassManager> + Send + Sync>;

/// Frames needed before the complexity of a frame can be estimated.
const MIN_SAMPLES: usize = 10;
/// Frames between two updates of the reference size.
const REFRESH_PERIOD: usize = 5;
/// Frames kept to compute the reference size.
const HISTORY: usize = 60;
/// Complexity change, in percent, that moves the QP by one.
const QP_STEP: i32 = 25;
const MAX_QP_OFFSET: i32 = 3;

/// Default manager: frames larger than average get a higher QP, smaller
/// ones a lower QP.
#[derive(Debug, Default)]
pub struct LookAheadManager {
    sizes: VecDeque<u32>,
    average: Option<u32>,
    since_refresh: usize,
}

impl LookAheadManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Average picture size the complexity is computed against, once known.
    pub fn average(&self) -> Option<u32> {
        self.average
    }

    fn refresh(&mut self) {
        let total: u64 = self.sizes.iter().map(|s| *s as u64).sum();
        self.average = Some((total / self.sizes.len() as u64) as u32);
        self.since_refresh = 0;
        trace!("Look-ahead: average picture size {:?}", self.average);
    }
}

impl TwoPassManager for LookAheadManager {
    fn add_frame(&mut self, stats: &LookAheadMeta) {
        if self.sizes.len() == HISTORY {
            self.sizes.pop_front();
        }
        self.sizes.push_back(stats.picture_size);
        self.since_refresh += 1;

        if self.sizes.len() >= MIN_SAMPLES
            && (self.average.is_none() || self.since_refresh >= REFRESH_PERIOD)
        {
            self.refresh();
        }
    }

    fn hints(&mut self, window: &[LookAheadMeta]) -> PassHints {
        let Some(front) = window.first() else {
            return PassHints::default();
        };
        let complexity = self
            .average
            .map(|average| (front.picture_size as u64 * 100 / average.max(1) as u64) as u32);
        let qp_offset = complexity
            .map(|c| ((c as i32 - 100) / QP_STEP).clamp(-MAX_QP_OFFSET, MAX_QP_OFFSET) as i8)
            .unwrap_or(0);

        PassHints {
            complexity,
            scene_change: front.scene_change,
            qp_offset,
        }
    }

    fn flush(&mut self) {
        *self = Default::default();
    }
}
