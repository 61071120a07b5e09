//! Wall-clock accounting for model and tool calls.
//!
//! Segments are appended in the order calls complete, which is also the order
//! they start since the engine never overlaps calls within a run.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Model,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSegment {
    pub kind: SegmentKind,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TimeSegment {
    pub fn duration(&self) -> Duration {
        span(self.started_at, self.ended_at)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub total: Duration,
    pub model_time: Duration,
    pub tools_time: Duration,
    pub iterations: u32,
    pub segments: Vec<TimeSegment>,
}

#[derive(Clone, Debug, Default)]
pub struct TimingRecorder {
    segments: Vec<TimeSegment>,
}

impl TimingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        kind: SegmentKind,
        label: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) {
        self.segments.push(TimeSegment { kind, label: label.into(), started_at, ended_at });
    }

    /// Awaits `future` and records its wall-clock span, whatever it resolves to.
    pub async fn time<F, T>(&mut self, kind: SegmentKind, label: impl Into<String>, future: F) -> T
    where
        F: Future<Output = T>,
    {
        let started_at = Utc::now();
        let output = future.await;
        self.record(kind, label, started_at, Utc::now());
        output
    }

    pub fn segments(&self) -> &[TimeSegment] {
        &self.segments
    }

    pub fn model_time(&self) -> Duration {
        self.sum_of(SegmentKind::Model)
    }

    pub fn tools_time(&self) -> Duration {
        self.sum_of(SegmentKind::Tool)
    }

    /// Span from the first segment's start to the last segment's end, so time
    /// spent between calls is included.
    pub fn total(&self) -> Duration {
        match (self.segments.first(), self.segments.last()) {
            (Some(first), Some(last)) => span(first.started_at, last.ended_at),
            _ => Duration::ZERO,
        }
    }

    pub fn summary(&self, iterations: u32) -> TimingSummary {
        TimingSummary {
            total: self.total(),
            model_time: self.model_time(),
            tools_time: self.tools_time(),
            iterations,
            segments: self.segments.clone(),
        }
    }

    fn sum_of(&self, kind: SegmentKind) -> Duration {
        self.segments
            .iter()
            .filter(|segment| segment.kind == kind)
            .map(TimeSegment::duration)
            .sum()
    }
}

fn span(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use super::{SegmentKind, TimingRecorder};

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + millis).single().expect("valid timestamp")
    }

    #[test]
    fn empty_recorder_reports_zero_durations() {
        let recorder = TimingRecorder::new();

        assert_eq!(recorder.total(), Duration::ZERO);
        assert_eq!(recorder.model_time(), Duration::ZERO);
        assert_eq!(recorder.tools_time(), Duration::ZERO);
        assert_eq!(recorder.summary(0).iterations, 0);
    }

    #[test]
    fn kind_sums_match_segment_durations() {
        let mut recorder = TimingRecorder::new();
        recorder.record(SegmentKind::Model, "Initial response", at(0), at(120));
        recorder.record(SegmentKind::Tool, "search", at(125), at(175));
        recorder.record(SegmentKind::Tool, "fetch", at(180), at(200));
        recorder.record(SegmentKind::Model, "Model response (iteration 1)", at(210), at(300));

        let model_sum: Duration = recorder
            .segments()
            .iter()
            .filter(|segment| segment.kind == SegmentKind::Model)
            .map(|segment| segment.duration())
            .sum();

        assert_eq!(recorder.model_time(), model_sum);
        assert_eq!(recorder.model_time(), Duration::from_millis(210));
        assert_eq!(recorder.tools_time(), Duration::from_millis(70));
    }

    #[test]
    fn total_spans_gaps_between_segments() {
        let mut recorder = TimingRecorder::new();
        recorder.record(SegmentKind::Model, "Initial response", at(0), at(100));
        recorder.record(SegmentKind::Tool, "search", at(400), at(450));

        assert_eq!(recorder.total(), Duration::from_millis(450));
        assert!(recorder.total() > recorder.model_time() + recorder.tools_time());
    }

    #[test]
    fn inverted_timestamps_clamp_to_zero() {
        let mut recorder = TimingRecorder::new();
        recorder.record(SegmentKind::Tool, "skewed", at(50), at(10));

        assert_eq!(recorder.tools_time(), Duration::ZERO);
    }

    #[tokio::test]
    async fn timed_future_records_one_segment_in_order() {
        let mut recorder = TimingRecorder::new();
        let value = recorder.time(SegmentKind::Model, "Initial response", async { 7 }).await;
        let other = recorder.time(SegmentKind::Tool, "echo", async { "done" }).await;

        assert_eq!(value, 7);
        assert_eq!(other, "done");
        let labels: Vec<&str> =
            recorder.segments().iter().map(|segment| segment.label.as_str()).collect();
        assert_eq!(labels, vec!["Initial response", "echo"]);
        assert!(recorder.segments()[0].started_at <= recorder.segments()[1].started_at);
    }
}
