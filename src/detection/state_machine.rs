// src/detection/state_machine.rs
//
// Per (stream, event type) tracker:
//
//   IDLE → CANDIDATE → ACTIVE → COOLDOWN → IDLE
//
// `step` and `flush` are pure; `EventTracker` wraps them with the
// mutable slot and the logging.

use super::rules::EventRule;
use super::smoother::SeveritySmoother;
use crate::types::{EventType, RawDetection, Stream};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerState {
    Idle,
    Candidate {
        first_ts_ms: i64,
        last_ts_ms: i64,
        smoother: SeveritySmoother,
    },
    Active {
        ts_start_ms: i64,
        last_ts_ms: i64,
        smoother: SeveritySmoother,
    },
    Cooldown {
        until_ts_ms: i64,
    },
}

impl TrackerState {
    pub fn name(&self) -> &'static str {
        match self {
            TrackerState::Idle => "IDLE",
            TrackerState::Candidate { .. } => "CANDIDATE",
            TrackerState::Active { .. } => "ACTIVE",
            TrackerState::Cooldown { .. } => "COOLDOWN",
        }
    }
}

/// An event interval closed by the tracker, before ids and clip data
/// are attached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalizedSpan {
    pub ts_start_ms: i64,
    pub ts_end_ms: i64,
    pub severity: f32,
    pub confidence_raw: f32,
    pub frames: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Candidate never reached debounce before the gap tolerance ran out.
    CandidateExpired,
    /// Active span closed below `min_duration_ms`.
    TooShort { duration_ms: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next: TrackerState,
    pub finalized: Option<FinalizedSpan>,
    pub dropped: Option<DropReason>,
    /// The frame fell under the scene-quality gate.
    pub gated: bool,
}

impl Step {
    fn unchanged(state: TrackerState) -> Self {
        Self {
            next: state,
            finalized: None,
            dropped: None,
            gated: false,
        }
    }
}

// ============================================================================
// TRANSITIONS
// ============================================================================

/// Advances `state` by one detection. Frames must arrive in time order;
/// a frame older than the last qualifying one is ignored.
pub fn step(state: TrackerState, det: &RawDetection, rule: &EventRule) -> Step {
    let now = det.frame_ts_ms;

    if let TrackerState::Candidate { last_ts_ms, .. } | TrackerState::Active { last_ts_ms, .. } =
        &state
    {
        if now < *last_ts_ms {
            return Step::unchanged(state);
        }
    }

    let mut out = expire(state, now, rule);
    out.gated = rule.is_scene_gated(det.scene_quality);

    if !rule.qualifies(det.confidence, det.scene_quality) {
        return out;
    }

    out.next = match out.next {
        TrackerState::Idle => promote(
            now,
            now,
            SeveritySmoother::seeded(rule, det.confidence),
            rule,
        ),
        TrackerState::Candidate {
            first_ts_ms,
            mut smoother,
            ..
        } => {
            smoother.push(det.confidence);
            promote(first_ts_ms, now, smoother, rule)
        }
        TrackerState::Active {
            ts_start_ms,
            mut smoother,
            ..
        } => {
            smoother.push(det.confidence);
            TrackerState::Active {
                ts_start_ms,
                last_ts_ms: now,
                smoother,
            }
        }
        cooldown @ TrackerState::Cooldown { .. } => cooldown,
    };
    out
}

/// Closes whatever is open at the end of a trip. Candidates are dropped,
/// active spans are finalized if long enough, cooldowns simply end.
pub fn flush(state: TrackerState, rule: &EventRule) -> Step {
    match state {
        TrackerState::Idle | TrackerState::Cooldown { .. } => Step::unchanged(TrackerState::Idle),
        TrackerState::Candidate { .. } => Step {
            next: TrackerState::Idle,
            finalized: None,
            dropped: Some(DropReason::CandidateExpired),
            gated: false,
        },
        TrackerState::Active {
            ts_start_ms,
            last_ts_ms,
            smoother,
        } => {
            let mut out = close(ts_start_ms, last_ts_ms, &smoother, rule);
            out.next = TrackerState::Idle;
            out
        }
    }
}

/// Applies the passage of time up to `now` before the frame itself is
/// looked at.
fn expire(state: TrackerState, now: i64, rule: &EventRule) -> Step {
    let mut out = match state {
        TrackerState::Candidate { last_ts_ms, .. } if now - last_ts_ms > rule.gap_tolerance_ms => {
            Step {
                next: TrackerState::Idle,
                finalized: None,
                dropped: Some(DropReason::CandidateExpired),
                gated: false,
            }
        }
        TrackerState::Active {
            ts_start_ms,
            last_ts_ms,
            ref smoother,
        } if now - last_ts_ms > rule.gap_tolerance_ms => {
            close(ts_start_ms, last_ts_ms, smoother, rule)
        }
        other => Step::unchanged(other),
    };

    // Checked after a close as well, so a zero cooldown frees the slot
    // for this very frame.
    if let TrackerState::Cooldown { until_ts_ms } = out.next {
        if now >= until_ts_ms {
            out.next = TrackerState::Idle;
        }
    }
    out
}

fn promote(
    first_ts_ms: i64,
    last_ts_ms: i64,
    smoother: SeveritySmoother,
    rule: &EventRule,
) -> TrackerState {
    if last_ts_ms - first_ts_ms >= rule.debounce_ms {
        TrackerState::Active {
            ts_start_ms: first_ts_ms,
            last_ts_ms,
            smoother,
        }
    } else {
        TrackerState::Candidate {
            first_ts_ms,
            last_ts_ms,
            smoother,
        }
    }
}

fn close(ts_start_ms: i64, last_ts_ms: i64, smoother: &SeveritySmoother, rule: &EventRule) -> Step {
    let duration_ms = last_ts_ms - ts_start_ms;
    if duration_ms < rule.min_duration_ms {
        return Step {
            next: TrackerState::Idle,
            finalized: None,
            dropped: Some(DropReason::TooShort { duration_ms }),
            gated: false,
        };
    }

    Step {
        next: TrackerState::Cooldown {
            until_ts_ms: last_ts_ms + rule.cooldown_ms,
        },
        finalized: Some(FinalizedSpan {
            ts_start_ms,
            ts_end_ms: last_ts_ms,
            severity: smoother.severity(),
            confidence_raw: smoother.mean_confidence(),
            frames: smoother.frames(),
        }),
        dropped: None,
        gated: false,
    }
}

// ============================================================================
// TRACKER
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub frames: u64,
    pub frames_gated: u64,
    pub candidates_discarded: u64,
    pub short_events_discarded: u64,
    pub events_finalized: u64,
}

impl TrackerStats {
    pub fn merge(mut self, other: TrackerStats) -> TrackerStats {
        self.frames += other.frames;
        self.frames_gated += other.frames_gated;
        self.candidates_discarded += other.candidates_discarded;
        self.short_events_discarded += other.short_events_discarded;
        self.events_finalized += other.events_finalized;
        self
    }
}

/// Owns the state slot for one (stream, type) pair within one trip.
pub struct EventTracker {
    stream: Stream,
    event_type: EventType,
    rule: EventRule,
    state: TrackerState,
    stats: TrackerStats,
}

impl EventTracker {
    pub fn new(stream: Stream, event_type: EventType, rule: EventRule) -> Self {
        Self {
            stream,
            event_type,
            rule,
            state: TrackerState::Idle,
            stats: TrackerStats::default(),
        }
    }

    pub fn update(&mut self, det: &RawDetection) -> Option<FinalizedSpan> {
        self.stats.frames += 1;
        let prev = std::mem::replace(&mut self.state, TrackerState::Idle);
        let prev_name = prev.name();
        let out = step(prev, det, &self.rule);
        if out.gated {
            self.stats.frames_gated += 1;
        }
        self.apply(prev_name, out, det.frame_ts_ms)
    }

    pub fn finish(&mut self) -> Option<FinalizedSpan> {
        let prev = std::mem::replace(&mut self.state, TrackerState::Idle);
        let prev_name = prev.name();
        let out = flush(prev, &self.rule);
        self.apply(prev_name, out, i64::MAX)
    }

    /// Feeds a whole time-ordered sequence and flushes at the end.
    pub fn run<'a, I>(mut self, detections: I) -> (Vec<FinalizedSpan>, TrackerStats)
    where
        I: IntoIterator<Item = &'a RawDetection>,
    {
        let mut spans = Vec::new();
        for det in detections {
            if let Some(span) = self.update(det) {
                spans.push(span);
            }
        }
        if let Some(span) = self.finish() {
            spans.push(span);
        }
        (spans, self.stats)
    }

    fn apply(&mut self, prev_name: &'static str, out: Step, ts_ms: i64) -> Option<FinalizedSpan> {
        match out.dropped {
            Some(DropReason::CandidateExpired) => {
                self.stats.candidates_discarded += 1;
                debug!(
                    "{}/{}: candidate discarded before debounce",
                    self.stream, self.event_type
                );
            }
            Some(DropReason::TooShort { duration_ms }) => {
                self.stats.short_events_discarded += 1;
                debug!(
                    "{}/{}: active span of {}ms below min duration {}ms, discarded",
                    self.stream, self.event_type, duration_ms, self.rule.min_duration_ms
                );
            }
            None => {}
        }

        if out.next.name() != prev_name {
            debug!(
                "{}/{}: {} → {} at {}ms",
                self.stream,
                self.event_type,
                prev_name,
                out.next.name(),
                ts_ms
            );
        }

        if out.finalized.is_some() {
            self.stats.events_finalized += 1;
        }
        self.state = out.next;
        out.finalized
    }
}
