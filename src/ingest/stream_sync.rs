// src/ingest/stream_sync.rs
//
// Puts every camera's clips on one trip-relative millisecond axis.
// The front camera is the anchor; other streams carry a clock offset
// relative to it.

use super::clip_name::ClipName;
use crate::error::ConfigError;
use crate::types::Stream;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ClipInput {
    pub stream: Stream,
    pub name: String,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedClip {
    pub stream: Stream,
    pub name: String,
    /// Trip-relative start.
    pub start_ms: i64,
    pub duration_ms: i64,
}

impl PlacedClip {
    pub fn end_ms(&self) -> i64 {
        self.start_ms + self.duration_ms
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    offsets: BTreeMap<Stream, f64>,
    /// Per stream, in chronological order.
    clips: BTreeMap<Stream, Vec<PlacedClip>>,
}

impl SyncPlan {
    /// Orders each stream's clips and computes the per-stream offsets.
    /// A stream whose names carry no usable clock gets offset 0 and its
    /// clips laid end to end; only a missing front stream is fatal.
    pub fn build(trip_id: &str, inputs: &[ClipInput]) -> Result<Self, ConfigError> {
        let mut by_stream: BTreeMap<Stream, Vec<(ClipName, &ClipInput)>> = BTreeMap::new();
        for input in inputs {
            if input.stream == Stream::Unknown {
                warn!("Trip {}: clip {} has no camera stream, skipping", trip_id, input.name);
                continue;
            }
            by_stream
                .entry(input.stream)
                .or_default()
                .push((ClipName::parse(&input.name), input));
        }

        if !by_stream.contains_key(&Stream::Front) {
            return Err(ConfigError::MissingAnchorStream {
                trip_id: trip_id.to_string(),
            });
        }

        let mut firsts: BTreeMap<Stream, Option<u32>> = BTreeMap::new();
        let mut clips = BTreeMap::new();

        for (stream, mut entries) in by_stream {
            let usable = entries.iter().all(|(name, _)| name.is_usable());
            if usable {
                entries.sort_by(|a, b| a.0.sort_cmp(&b.0));
            } else {
                warn!(
                    "Trip {}: {} clip names carry no usable start time, laying clips end to end",
                    trip_id, stream
                );
            }

            let first = entries.first().and_then(|(name, _)| name.seconds_of_day);
            firsts.insert(stream, if usable { first } else { None });

            let mut placed = Vec::with_capacity(entries.len());
            let mut cursor = 0_i64;
            for (name, input) in entries {
                let duration_ms = input.duration_ms.unwrap_or_else(|| {
                    warn!("Trip {}: clip {} has no duration", trip_id, input.name);
                    0
                });
                let start_ms = match (usable, name.seconds_of_day, first) {
                    (true, Some(at), Some(first)) => (at as i64 - first as i64) * 1000,
                    _ => cursor,
                };
                cursor = start_ms + duration_ms;
                placed.push(PlacedClip {
                    stream,
                    name: input.name.clone(),
                    start_ms,
                    duration_ms,
                });
            }
            clips.insert(stream, placed);
        }

        let anchor = firsts.get(&Stream::Front).copied().flatten();
        let offsets = firsts
            .iter()
            .map(|(&stream, first)| {
                let offset = match (anchor, first) {
                    (Some(anchor), Some(first)) => *first as f64 - anchor as f64,
                    _ => 0.0,
                };
                (stream, offset)
            })
            .collect::<BTreeMap<_, _>>();

        for (stream, offset) in &offsets {
            debug!("Trip {}: {} offset {:+.1}s", trip_id, stream, offset);
        }

        Ok(Self { offsets, clips })
    }

    pub fn offsets(&self) -> &BTreeMap<Stream, f64> {
        &self.offsets
    }

    pub fn offset_seconds(&self, stream: Stream) -> f64 {
        self.offsets.get(&stream).copied().unwrap_or(0.0)
    }

    pub fn streams_present(&self) -> Vec<Stream> {
        self.clips.keys().copied().collect()
    }

    pub fn clips(&self, stream: Stream) -> &[PlacedClip] {
        self.clips.get(&stream).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Trip length is the furthest clip end on any stream.
    pub fn duration_ms(&self) -> i64 {
        self.clips
            .values()
            .flatten()
            .map(PlacedClip::end_ms)
            .max()
            .unwrap_or(0)
            .max(0)
    }

    /// Maps a clip-local timestamp to the trip axis.
    pub fn to_trip_ms(&self, stream: Stream, clip_name: &str, local_ms: i64) -> Option<i64> {
        self.clips(stream)
            .iter()
            .find(|c| c.name == clip_name)
            .map(|c| c.start_ms + local_ms)
    }

    /// The clip of `stream` covering `ts_ms`, with the clip-local offset.
    pub fn clip_at(&self, stream: Stream, ts_ms: i64) -> Option<(&str, i64)> {
        self.clips(stream)
            .iter()
            .rev()
            .find(|c| c.start_ms <= ts_ms)
            .map(|c| (c.name.as_str(), ts_ms - c.start_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(stream: Stream, name: &str, duration_ms: i64) -> ClipInput {
        ClipInput {
            stream,
            name: name.to_string(),
            duration_ms: Some(duration_ms),
        }
    }

    #[test]
    fn test_offsets_relative_to_front() {
        let inputs = vec![
            clip(Stream::Front, "080100_002_001_NF.mp4", 60_000),
            clip(Stream::Front, "080000_001_001_NF.mp4", 60_000),
            clip(Stream::Cabin, "080003_001_001_IN.mp4", 60_000),
        ];
        let plan = SyncPlan::build("t1", &inputs).unwrap();

        assert_eq!(plan.offset_seconds(Stream::Front), 0.0);
        assert_eq!(plan.offset_seconds(Stream::Cabin), 3.0);
        let front = plan.clips(Stream::Front);
        assert_eq!(front[0].name, "080000_001_001_NF.mp4");
        assert_eq!(front[1].start_ms, 60_000);
        assert_eq!(plan.duration_ms(), 120_000);
        assert_eq!(plan.streams_present(), vec![Stream::Front, Stream::Cabin]);
    }

    #[test]
    fn test_missing_front_is_fatal() {
        let inputs = vec![clip(Stream::Cabin, "080003_001_001_IN.mp4", 60_000)];
        let err = SyncPlan::build("t2", &inputs).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAnchorStream { ref trip_id } if trip_id == "t2"));
    }

    #[test]
    fn test_unusable_stream_defaults_to_zero_offset() {
        let inputs = vec![
            clip(Stream::Front, "080000_001_001_NF.mp4", 30_000),
            clip(Stream::Rear, "rear_a.mp4", 20_000),
            clip(Stream::Rear, "rear_b.mp4", 20_000),
        ];
        let plan = SyncPlan::build("t3", &inputs).unwrap();

        assert_eq!(plan.offset_seconds(Stream::Rear), 0.0);
        let rear = plan.clips(Stream::Rear);
        assert_eq!(rear[0].start_ms, 0);
        assert_eq!(rear[1].start_ms, 20_000);
        assert_eq!(plan.duration_ms(), 40_000);
    }

    #[test]
    fn test_clip_lookup_both_directions() {
        let inputs = vec![
            clip(Stream::Front, "080000_001_001_NF.mp4", 60_000),
            clip(Stream::Front, "080100_002_001_NF.mp4", 60_000),
        ];
        let plan = SyncPlan::build("t4", &inputs).unwrap();

        assert_eq!(
            plan.to_trip_ms(Stream::Front, "080100_002_001_NF.mp4", 1_500),
            Some(61_500)
        );
        assert_eq!(
            plan.clip_at(Stream::Front, 61_500),
            Some(("080100_002_001_NF.mp4", 1_500))
        );
        assert_eq!(plan.clip_at(Stream::Rear, 10), None);
        assert_eq!(plan.to_trip_ms(Stream::Front, "nope.mp4", 0), None);
    }
}
