//! Temporal clustering of one equipment's telemetry.

use crate::config::{GapMode, ReconcileConfig};
use crate::storage::ActualEvent;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clustering {
    pub window: Duration,
    pub mode: GapMode,
}

impl Default for Clustering {
    fn default() -> Self {
        Self::from(&ReconcileConfig::default())
    }
}

impl From<&ReconcileConfig> for Clustering {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            window: config.cluster_window,
            mode: config.cluster_gap_mode,
        }
    }
}

impl Clustering {
    pub fn split<'a>(&self, events: &'a [ActualEvent]) -> Vec<&'a [ActualEvent]> {
        cluster_events(events, self.window, self.mode)
    }
}

/// Splits events (ordered by track-in time) into contiguous clusters.
///
/// In `Session` mode an event joins the current cluster when it is within
/// `window` of the previous event, so a cluster can drift past `window` from
/// its own start. `FromStart` measures against the cluster's first event.
/// The window is inclusive.
pub fn cluster_events(events: &[ActualEvent], window: Duration, mode: GapMode) -> Vec<&[ActualEvent]> {
    let mut clusters = Vec::new();
    if events.is_empty() {
        return clusters;
    }

    let window_micros = i64::try_from(window.as_micros()).unwrap_or(i64::MAX);
    let mut start = 0;

    for i in 1..events.len() {
        let anchor = match mode {
            GapMode::Session => &events[i - 1],
            GapMode::FromStart => &events[start],
        };
        let gap = (events[i].track_in_time - anchor.track_in_time)
            .num_microseconds()
            .map(i64::abs);

        let joins = matches!(gap, Some(g) if g <= window_micros);
        if !joins {
            clusters.push(&events[start..i]);
            start = i;
        }
    }
    clusters.push(&events[start..]);

    clusters
}
