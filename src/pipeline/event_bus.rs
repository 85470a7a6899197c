// src/pipeline/event_bus.rs
//
// Side effects of event finalization (persistence, snapshot and clip
// extraction) are published here instead of being performed inline, so
// aggregation never waits on I/O.

use crate::types::{Event, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactRequest {
    Persist {
        trip_id: String,
        event_id: String,
    },

    ExtractSnapshot {
        trip_id: String,
        event_id: String,
        stream: Stream,
        clip_name: String,
        /// Clip-local position of the frame to grab.
        at_ms: i64,
        label: String,
        output: String,
    },

    ExtractClip {
        trip_id: String,
        event_id: String,
        stream: Stream,
        clip_name: String,
        start_ms: i64,
        end_ms: i64,
        label: String,
        output: String,
    },
}

/// Evidence window around an event, relative to its center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipWindow {
    pub pre_event_ms: i64,
    pub post_event_ms: i64,
}

impl ArtifactRequest {
    /// Requests for the `index`-th (1-based) event of a trip. Events that
    /// cannot be located in a source clip only get persisted.
    pub fn for_event(event: &Event, index: usize, window: ClipWindow) -> Vec<ArtifactRequest> {
        let mut requests = vec![ArtifactRequest::Persist {
            trip_id: event.trip_id.clone(),
            event_id: event.id.clone(),
        }];

        let (Some(clip_name), Some(offset)) = (&event.clip_name, event.clip_offset_ms) else {
            return requests;
        };
        let center = offset + event.duration_ms() / 2;
        let label = event.event_type.label();

        requests.push(ArtifactRequest::ExtractSnapshot {
            trip_id: event.trip_id.clone(),
            event_id: event.id.clone(),
            stream: event.stream,
            clip_name: clip_name.clone(),
            at_ms: center,
            label: label.clone(),
            output: format!("snapshots/event_{:04}.jpg", index),
        });
        requests.push(ArtifactRequest::ExtractClip {
            trip_id: event.trip_id.clone(),
            event_id: event.id.clone(),
            stream: event.stream,
            clip_name: clip_name.clone(),
            start_ms: (center - window.pre_event_ms).max(0),
            end_ms: center + window.post_event_ms,
            label,
            output: format!("clips/event_{:04}.mp4", index),
        });
        requests
    }
}

/// Upper bound on what `ArtifactRequest::for_event` emits for one event.
pub const REQUESTS_PER_EVENT: usize = 3;

pub struct EventBus {
    events: VecDeque<ArtifactRequest>,
    max_pending: usize,
    dropped: u64,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
            dropped: 0,
        }
    }

    pub fn publish(&mut self, request: ArtifactRequest) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Artifact queue full ({} requests), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
            self.dropped += 1;
        }
        debug!("Queued artifact request: {:?}", request);
        self.events.push_back(request);
    }

    pub fn drain(&mut self) -> Vec<ArtifactRequest> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;

    fn event(clip: Option<&str>) -> Event {
        Event {
            id: "e1".into(),
            trip_id: "trip".into(),
            event_type: EventType::MobilePhoneUse,
            stream: Stream::Cabin,
            ts_start_ms: 61_000,
            ts_end_ms: 63_000,
            severity: 0.7,
            confidence_raw: 0.8,
            confidence_calibrated: None,
            clip_name: clip.map(str::to_string),
            clip_offset_ms: clip.map(|_| 1_000),
        }
    }

    const WINDOW: ClipWindow = ClipWindow {
        pre_event_ms: 5_000,
        post_event_ms: 5_000,
    };

    #[test]
    fn test_requests_for_located_event() {
        let requests = ArtifactRequest::for_event(&event(Some("120000_000_001_A.mp4")), 3, WINDOW);
        assert_eq!(requests.len(), 3);
        match &requests[1] {
            ArtifactRequest::ExtractSnapshot { at_ms, label, output, .. } => {
                assert_eq!(*at_ms, 2_000);
                assert_eq!(label, "MOBILE PHONE USE");
                assert_eq!(output, "snapshots/event_0003.jpg");
            }
            other => panic!("unexpected {:?}", other),
        }
        match &requests[2] {
            ArtifactRequest::ExtractClip { start_ms, end_ms, .. } => {
                assert_eq!(*start_ms, 0);
                assert_eq!(*end_ms, 7_000);
            }
            other => panic!("unexpected {:?}", other),
        }

        let json = serde_json::to_string(&requests[0]).unwrap();
        assert!(json.starts_with("{\"kind\":\"persist\""));
    }

    #[test]
    fn test_unlocated_event_is_only_persisted() {
        let requests = ArtifactRequest::for_event(&event(None), 1, WINDOW);
        assert_eq!(requests.len(), 1);
        assert!(matches!(requests[0], ArtifactRequest::Persist { .. }));
    }

    #[test]
    fn test_bus_drops_oldest_when_full() {
        let mut bus = EventBus::new(2);
        for i in 0..3 {
            bus.publish(ArtifactRequest::Persist {
                trip_id: "t".into(),
                event_id: format!("e{}", i),
            });
        }
        assert_eq!(bus.pending_count(), 2);
        assert_eq!(bus.dropped(), 1);
        let drained = bus.drain();
        assert_eq!(
            drained[0],
            ArtifactRequest::Persist {
                trip_id: "t".into(),
                event_id: "e1".into()
            }
        );
        assert_eq!(bus.pending_count(), 0);
    }
}
