// src/detection/aggregator.rs
//
// Runs one tracker per (stream, event type) over a trip's merged
// timeline. Trackers share nothing, so each key runs on its own rayon
// task; events are re-sorted afterwards so output order never depends
// on scheduling.

use super::rules::EventRules;
use super::state_machine::{EventTracker, FinalizedSpan, TrackerStats};
use crate::ingest::SyncPlan;
use crate::types::{Event, EventType, RawDetection, Stream};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything one trip pass needs. Lives for the duration of the pass;
/// no tracker outlives it.
pub struct TripContext<'a> {
    pub trip_id: &'a str,
    pub rules: &'a EventRules,
    pub sync: Option<&'a SyncPlan>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregationOutput {
    pub events: Vec<Event>,
    pub stats: TrackerStats,
}

pub fn aggregate_trip(ctx: &TripContext<'_>, timeline: &[RawDetection]) -> AggregationOutput {
    let mut partitions: BTreeMap<(Stream, EventType), Vec<&RawDetection>> = BTreeMap::new();
    for det in timeline {
        partitions
            .entry((det.stream, det.event_type))
            .or_default()
            .push(det);
    }
    debug!(
        "Trip {}: {} detections across {} tracker(s)",
        ctx.trip_id,
        timeline.len(),
        partitions.len()
    );

    let results: Vec<((Stream, EventType), Vec<FinalizedSpan>, TrackerStats)> = partitions
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|((stream, event_type), frames)| {
            let tracker = EventTracker::new(stream, event_type, ctx.rules.get(event_type));
            let (spans, stats) = tracker.run(frames);
            ((stream, event_type), spans, stats)
        })
        .collect();

    let mut output = AggregationOutput::default();
    for ((stream, event_type), spans, stats) in results {
        output.stats = output.stats.merge(stats);
        output.events.extend(
            spans
                .into_iter()
                .map(|span| build_event(ctx, stream, event_type, &span)),
        );
    }

    output.events.sort_by(|a, b| {
        a.ts_start_ms
            .cmp(&b.ts_start_ms)
            .then(a.stream.cmp(&b.stream))
            .then(a.event_type.cmp(&b.event_type))
    });

    for event in &output.events {
        info!(
            "Trip {}: {} on {} [{}ms → {}ms] severity {:.2}",
            ctx.trip_id,
            event.event_type,
            event.stream,
            event.ts_start_ms,
            event.ts_end_ms,
            event.severity
        );
    }
    output
}

/// Same trip, stream, type and start always give the same id.
pub fn event_id(trip_id: &str, stream: Stream, event_type: EventType, ts_start_ms: i64) -> String {
    let key = format!("{}:{}:{}:{}", trip_id, stream, event_type, ts_start_ms);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

fn build_event(
    ctx: &TripContext<'_>,
    stream: Stream,
    event_type: EventType,
    span: &FinalizedSpan,
) -> Event {
    let clip = ctx.sync.and_then(|plan| plan.clip_at(stream, span.ts_start_ms));
    Event {
        id: event_id(ctx.trip_id, stream, event_type, span.ts_start_ms),
        trip_id: ctx.trip_id.to_string(),
        event_type,
        stream,
        ts_start_ms: span.ts_start_ms,
        ts_end_ms: span.ts_end_ms,
        severity: span.severity.clamp(0.0, 1.0),
        confidence_raw: span.confidence_raw.clamp(0.0, 1.0),
        confidence_calibrated: None,
        clip_name: clip.map(|(name, _)| name.to_string()),
        clip_offset_ms: clip.map(|(_, offset)| offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::rules::default_rule;
    use crate::ingest::ClipInput;

    fn frames(
        stream: Stream,
        event_type: EventType,
        from: i64,
        to: i64,
        confidence: f32,
    ) -> Vec<RawDetection> {
        (from..=to)
            .step_by(100)
            .map(|ts| RawDetection {
                stream,
                event_type,
                confidence,
                frame_ts_ms: ts,
                scene_quality: 0.9,
            })
            .collect()
    }

    fn merged(mut parts: Vec<Vec<RawDetection>>) -> Vec<RawDetection> {
        let mut all: Vec<_> = parts.drain(..).flatten().collect();
        all.sort_by_key(|d| d.frame_ts_ms);
        all
    }

    #[test]
    fn test_independent_trackers_per_key() {
        let rules = EventRules::default();
        let timeline = merged(vec![
            frames(Stream::Front, EventType::Tailgating, 0, 3_000, 0.8),
            frames(Stream::Cabin, EventType::MobilePhoneUse, 1_000, 2_500, 0.7),
            frames(Stream::Rear, EventType::Tailgating, 0, 200, 0.9),
        ]);
        let ctx = TripContext {
            trip_id: "trip-a",
            rules: &rules,
            sync: None,
        };
        let out = aggregate_trip(&ctx, &timeline);

        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[0].event_type, EventType::Tailgating);
        assert_eq!(out.events[0].stream, Stream::Front);
        assert_eq!(out.events[1].event_type, EventType::MobilePhoneUse);
        assert_eq!(out.stats.events_finalized, 2);
        assert_eq!(out.stats.candidates_discarded, 1);
        assert_eq!(out.stats.frames, timeline.len() as u64);
    }

    #[test]
    fn test_events_carry_clip_and_stable_id() {
        let rules = EventRules::default();
        let plan = SyncPlan::build(
            "trip-b",
            &[
                ClipInput {
                    stream: Stream::Front,
                    name: "080000_001_001_NF.mp4".into(),
                    duration_ms: Some(1_000),
                },
                ClipInput {
                    stream: Stream::Front,
                    name: "080001_002_001_NF.mp4".into(),
                    duration_ms: Some(60_000),
                },
            ],
        )
        .unwrap();
        let timeline = frames(Stream::Front, EventType::LaneDeviation, 1_200, 2_500, 0.9);
        let ctx = TripContext {
            trip_id: "trip-b",
            rules: &rules,
            sync: Some(&plan),
        };

        let first = aggregate_trip(&ctx, &timeline);
        let second = aggregate_trip(&ctx, &timeline);
        assert_eq!(first.events, second.events);

        let event = &first.events[0];
        assert_eq!(event.clip_name.as_deref(), Some("080001_002_001_NF.mp4"));
        assert_eq!(event.clip_offset_ms, Some(200));
        assert_eq!(
            event.id,
            event_id("trip-b", Stream::Front, EventType::LaneDeviation, 1_200)
        );
    }

    #[test]
    fn test_per_type_rule_applies() {
        let mut rules = EventRules::default();
        let mut strict = default_rule(EventType::Tailgating);
        strict.confidence_threshold = 0.95;
        rules.set(EventType::Tailgating, strict);

        let timeline = frames(Stream::Front, EventType::Tailgating, 0, 3_000, 0.8);
        let ctx = TripContext {
            trip_id: "trip-c",
            rules: &rules,
            sync: None,
        };
        assert!(aggregate_trip(&ctx, &timeline).events.is_empty());
    }
}
