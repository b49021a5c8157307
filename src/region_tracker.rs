//! Turns raw person-detector output into a stable set of tracked people.
//!
//! Detectors like to report one person as a handful of overlapping boxes,
//! and every so often they see a person in a coat rack for a single frame.
//! The [`RegionTracker`] deals with both: nearby boxes are merged, and a
//! region that shows up out of nowhere is only believed once it has been
//! seen in every slot of a short [`History`].

use crate::camera::PersonDetector;
use crate::region::{DetectionBox, Region};
use crate::settings::TrackerSettings;

use log::debug;

/// The last few sets of detections, newest first. Every slot holds the
/// regions detected during one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    slots: Vec<Vec<Region>>,
}

impl History {
    /// An empty history. Slots are allocated on the first rotation.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// The slots, newest first.
    pub fn slots(&self) -> &[Vec<Region>] {
        &self.slots
    }

    /// Whether nothing has been rotated in yet.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Merges and confirms detector output. Holds no per-camera state; the
/// confirmed people and the [`History`] belong to the caller.
#[derive(Debug, Clone)]
pub struct RegionTracker {
    settings: TrackerSettings,
}

impl RegionTracker {
    /// Instantiates a new [`RegionTracker`] with the given thresholds.
    pub fn new(settings: TrackerSettings) -> Self {
        Self { settings }
    }

    /// The thresholds this tracker was built with.
    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Runs the detector on `frame` and drops every box scoring below the
    /// score threshold.
    pub fn detect<F, D>(&self, detector: &mut D, frame: &F) -> Vec<DetectionBox>
    where
        D: PersonDetector<F> + ?Sized,
    {
        let boxes = detector.detect(frame);
        let total = boxes.len();
        let kept: Vec<DetectionBox> = boxes
            .into_iter()
            .filter(|b| b.score >= self.settings.score_threshold)
            .collect();
        if kept.len() != total {
            debug!(
                "dropped {} of {} detections below score {}",
                total - kept.len(),
                total,
                self.settings.score_threshold
            );
        }
        kept
    }

    /// Merges nearby boxes, then filters out regions that are neither close
    /// to an already confirmed person nor persistent across the whole
    /// history.
    ///
    /// `previous` is `None` until this camera has confirmed anyone; in that
    /// case the merged regions are returned unfiltered.
    pub fn normalize(
        &self,
        boxes: &[DetectionBox],
        previous: Option<&[Region]>,
        history: &History,
    ) -> Vec<Region> {
        let merged = self.merge(boxes);

        match previous {
            None => merged,
            Some(previous) => self.filter_new_people(merged, previous, history),
        }
    }

    /// Pushes the newest detections into `history`, dropping the oldest
    /// slot. An empty history is first filled with empty slots.
    pub fn rotate_history(&self, newest: Vec<Region>, history: &mut History) {
        let size = self.settings.history_size.max(1);
        if history.slots.is_empty() {
            history.slots = vec![Vec::new(); size];
        }

        history.slots.truncate(size - 1);
        history.slots.insert(0, newest);
    }

    /// Single greedy pass over the boxes in detector order. A box joins
    /// every result whose enlarged bounds it touches, and starts a new
    /// result otherwise.
    fn merge(&self, boxes: &[DetectionBox]) -> Vec<Region> {
        let mut results: Vec<Region> = Vec::new();

        for candidate in boxes.iter().map(|b| b.region) {
            let mut intersects = false;
            for result in results.iter_mut() {
                if candidate.intersects(&result.enlarge(self.settings.group_threshold)) {
                    intersects = true;
                    *result = result.union(&candidate);
                }
            }

            if !intersects {
                results.push(candidate);
            }
        }

        results
    }

    fn filter_new_people(
        &self,
        regions: Vec<Region>,
        previous: &[Region],
        history: &History,
    ) -> Vec<Region> {
        let threshold = self.settings.group_threshold;

        regions
            .into_iter()
            .filter(|region| {
                let enlarged = region.enlarge(threshold);

                let tracked = previous.iter().any(|p| p.intersects(&enlarged));
                if tracked {
                    return true;
                }

                let persistent = !history.slots.is_empty()
                    && history
                        .slots
                        .iter()
                        .all(|slot| slot.iter().any(|h| h.intersects(&enlarged)));
                if !persistent {
                    debug!("ignoring unconfirmed region {}", region);
                }
                persistent
            })
            .collect()
    }
}

impl Default for RegionTracker {
    fn default() -> Self {
        Self::new(TrackerSettings::default())
    }
}
