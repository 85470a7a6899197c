// src/ingest/clip_name.rs
//
// Dashcam clip names look like `HHMMSS_NNN_NNN_<tag>[_rear].mp4`.

use crate::types::Stream;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipName {
    pub original: String,
    /// Wall-clock start of the clip. `None` when the name does not parse.
    pub seconds_of_day: Option<u32>,
    pub sequence: Option<String>,
    pub stream_hint: Stream,
}

impl ClipName {
    pub fn parse(name: &str) -> Self {
        match parse_parts(name) {
            Some((seconds_of_day, sequence, rear)) => Self {
                original: name.to_string(),
                seconds_of_day: Some(seconds_of_day),
                sequence: Some(sequence),
                stream_hint: if rear { Stream::Rear } else { Stream::Front },
            },
            None => Self {
                original: name.to_string(),
                seconds_of_day: None,
                sequence: None,
                stream_hint: Stream::Front,
            },
        }
    }

    pub fn is_usable(&self) -> bool {
        self.seconds_of_day.is_some()
    }

    /// Chronological order: start time, then sequence.
    pub fn sort_cmp(&self, other: &ClipName) -> Ordering {
        self.seconds_of_day
            .cmp(&other.seconds_of_day)
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.original.cmp(&other.original))
    }
}

fn parse_parts(name: &str) -> Option<(u32, String, bool)> {
    let lower = name.to_ascii_lowercase();
    let stem_len = lower.strip_suffix(".mp4")?.len();
    let mut stem = &name[..stem_len];

    let rear = stem.to_ascii_lowercase().ends_with("_rear");
    if rear {
        stem = &stem[..stem.len() - "_rear".len()];
    }

    let (clock, sequence) = stem.split_once('_')?;
    let seconds_of_day = parse_clock(clock)?;

    let mut parts = sequence.splitn(3, '_');
    let first = parts.next()?;
    let second = parts.next()?;
    let tag = parts.next()?;
    let is_counter = |p: &str| p.len() == 3 && p.bytes().all(|b| b.is_ascii_digit());
    if !is_counter(first)
        || !is_counter(second)
        || tag.is_empty()
        || !tag.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return None;
    }

    Some((seconds_of_day, sequence.to_string(), rear))
}

fn parse_clock(clock: &str) -> Option<u32> {
    if clock.len() != 6 || !clock.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let h: u32 = clock[0..2].parse().ok()?;
    let m: u32 = clock[2..4].parse().ok()?;
    let s: u32 = clock[4..6].parse().ok()?;
    if h > 23 || m > 59 || s > 59 {
        return None;
    }
    Some(h * 3600 + m * 60 + s)
}
