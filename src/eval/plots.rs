// src/eval/plots.rs
//
// Standalone SVG charts for the artifact bundle: reliability diagram and
// precision/recall/F1 against the confidence cutoff.

use super::metrics::{CalibrationMetrics, MetricValue};
use super::threshold::ThresholdSweep;
use std::fmt::Write;

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 480.0;
const MARGIN: f64 = 56.0;

const COLOR_DIAGONAL: &str = "#334155";
const COLOR_BINS: &str = "#0ea5e9";
const COLOR_PRECISION: &str = "#6366f1";
const COLOR_RECALL: &str = "#f59e0b";
const COLOR_F1: &str = "#14b8a6";

/// Unit-square plot area mapped onto the canvas.
struct Canvas {
    body: String,
}

impl Canvas {
    fn new(title: &str, x_label: &str, y_label: &str) -> Self {
        let mut c = Canvas { body: String::new() };
        c.frame(title, x_label, y_label);
        c
    }

    fn x(v: f64) -> f64 {
        MARGIN + v.clamp(0.0, 1.0) * (WIDTH - 2.0 * MARGIN)
    }

    fn y(v: f64) -> f64 {
        HEIGHT - MARGIN - v.clamp(0.0, 1.0) * (HEIGHT - 2.0 * MARGIN)
    }

    fn frame(&mut self, title: &str, x_label: &str, y_label: &str) {
        let _ = writeln!(
            self.body,
            r##"<rect x="{m}" y="{m}" width="{w}" height="{h}" fill="#ffffff" stroke="#94a3b8"/>"##,
            m = MARGIN,
            w = WIDTH - 2.0 * MARGIN,
            h = HEIGHT - 2.0 * MARGIN
        );
        for i in 0..=10 {
            let t = i as f64 / 10.0;
            let _ = writeln!(
                self.body,
                r##"<line x1="{x}" y1="{y0}" x2="{x}" y2="{y1}" stroke="#e2e8f0"/><line x1="{x0}" y1="{y}" x2="{x1}" y2="{y}" stroke="#e2e8f0"/>"##,
                x = Self::x(t),
                y = Self::y(t),
                x0 = Self::x(0.0),
                x1 = Self::x(1.0),
                y0 = Self::y(0.0),
                y1 = Self::y(1.0)
            );
            if i % 2 == 0 {
                let _ = writeln!(
                    self.body,
                    r#"<text x="{x:.1}" y="{ty:.1}" font-size="11" text-anchor="middle">{t:.1}</text><text x="{tx:.1}" y="{y:.1}" font-size="11" text-anchor="end">{t:.1}</text>"#,
                    x = Self::x(t),
                    ty = HEIGHT - MARGIN + 16.0,
                    tx = MARGIN - 6.0,
                    y = Self::y(t) + 4.0,
                    t = t
                );
            }
        }
        let _ = writeln!(
            self.body,
            r#"<text x="{cx}" y="28" font-size="16" text-anchor="middle">{title}</text>"#,
            cx = WIDTH / 2.0,
            title = title
        );
        let _ = writeln!(
            self.body,
            r#"<text x="{cx}" y="{by}" font-size="12" text-anchor="middle">{label}</text>"#,
            cx = WIDTH / 2.0,
            by = HEIGHT - 14.0,
            label = x_label
        );
        let _ = writeln!(
            self.body,
            r#"<text x="16" y="{cy}" font-size="12" text-anchor="middle" transform="rotate(-90 16 {cy})">{label}</text>"#,
            cy = HEIGHT / 2.0,
            label = y_label
        );
    }

    fn polyline(&mut self, points: &[(f64, f64)], color: &str, dashed: bool) {
        if points.is_empty() {
            return;
        }
        let coords: Vec<String> = points
            .iter()
            .map(|&(x, y)| format!("{:.1},{:.1}", Self::x(x), Self::y(y)))
            .collect();
        let dash = if dashed { r#" stroke-dasharray="6 4""# } else { "" };
        let _ = writeln!(
            self.body,
            r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2"{}/>"#,
            coords.join(" "),
            color,
            dash
        );
    }

    fn dot(&mut self, x: f64, y: f64, radius: f64, color: &str) {
        let _ = writeln!(
            self.body,
            r#"<circle cx="{:.1}" cy="{:.1}" r="{:.1}" fill="{}" fill-opacity="0.8"/>"#,
            Self::x(x),
            Self::y(y),
            radius,
            color
        );
    }

    fn legend(&mut self, entries: &[(&str, &str)]) {
        for (i, (name, color)) in entries.iter().enumerate() {
            let y = MARGIN + 16.0 + i as f64 * 18.0;
            let x = WIDTH - MARGIN - 130.0;
            let _ = writeln!(
                self.body,
                r#"<rect x="{x}" y="{ry}" width="12" height="12" fill="{color}"/><text x="{tx}" y="{y}" font-size="12">{name}</text>"#,
                x = x,
                ry = y - 10.0,
                tx = x + 18.0,
                y = y,
                color = color,
                name = name
            );
        }
    }

    fn note(&mut self, text: &str) {
        let _ = writeln!(
            self.body,
            r##"<text x="{cx}" y="{cy}" font-size="14" text-anchor="middle" fill="#64748b">{text}</text>"##,
            cx = WIDTH / 2.0,
            cy = HEIGHT / 2.0,
            text = text
        );
    }

    fn finish(self) -> String {
        format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\" font-family=\"sans-serif\">\n{body}</svg>\n",
            w = WIDTH,
            h = HEIGHT,
            body = self.body
        )
    }
}

pub fn reliability_diagram(calibration: &CalibrationMetrics) -> String {
    let mut canvas = Canvas::new(
        "Reliability Diagram",
        "Mean predicted confidence",
        "Empirical accuracy",
    );
    canvas.polyline(&[(0.0, 0.0), (1.0, 1.0)], COLOR_DIAGONAL, true);

    let points: Vec<(f64, f64, usize)> = calibration
        .bins
        .iter()
        .filter_map(|b| match (b.avg_confidence, b.accuracy) {
            (MetricValue::Value(c), MetricValue::Value(a)) => Some((c, a, b.count)),
            _ => None,
        })
        .collect();

    if points.is_empty() {
        canvas.note("insufficient_data");
    } else {
        let line: Vec<(f64, f64)> = points.iter().map(|&(c, a, _)| (c, a)).collect();
        canvas.polyline(&line, COLOR_BINS, false);
        let max_count = points.iter().map(|p| p.2).max().unwrap_or(1).max(1) as f64;
        for &(c, a, count) in &points {
            canvas.dot(c, a, 3.0 + 9.0 * (count as f64 / max_count).sqrt(), COLOR_BINS);
        }
    }
    canvas.legend(&[("Perfect calibration", COLOR_DIAGONAL), ("Bins", COLOR_BINS)]);
    canvas.finish()
}

pub fn threshold_curve(sweep: &ThresholdSweep) -> String {
    let mut canvas = Canvas::new("Metrics vs Confidence Threshold", "Threshold", "Score");

    let series = |pick: fn(&super::threshold::SweepRow) -> MetricValue| -> Vec<(f64, f64)> {
        sweep
            .rows
            .iter()
            .filter_map(|r| pick(r).value().map(|v| (r.threshold, v)))
            .collect()
    };
    let precision = series(|r| r.precision);
    let recall = series(|r| r.recall);
    let f1 = series(|r| r.f1);

    if f1.is_empty() && precision.is_empty() && recall.is_empty() {
        canvas.note("insufficient_data");
    }
    canvas.polyline(&precision, COLOR_PRECISION, false);
    canvas.polyline(&recall, COLOR_RECALL, false);
    canvas.polyline(&f1, COLOR_F1, false);
    for &(x, y) in &f1 {
        canvas.dot(x, y, 3.0, COLOR_F1);
    }
    if let Some(best) = sweep.global_best {
        canvas.polyline(&[(best.threshold, 0.0), (best.threshold, 1.0)], COLOR_DIAGONAL, true);
    }
    canvas.legend(&[
        ("Precision", COLOR_PRECISION),
        ("Recall", COLOR_RECALL),
        ("F1", COLOR_F1),
    ]);
    canvas.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::matcher::MatchConfig;
    use crate::eval::metrics::ReliabilityBin;
    use crate::eval::threshold::{sweep_thresholds, Objective};

    #[test]
    fn test_reliability_diagram_draws_filled_bins() {
        let cal = CalibrationMetrics {
            samples: 4,
            ece: MetricValue::Value(0.1),
            brier: MetricValue::Value(0.2),
            bins: vec![
                ReliabilityBin {
                    bin: 0,
                    low: 0.0,
                    high: 0.5,
                    count: 0,
                    avg_confidence: MetricValue::INSUFFICIENT,
                    accuracy: MetricValue::INSUFFICIENT,
                },
                ReliabilityBin {
                    bin: 1,
                    low: 0.5,
                    high: 1.0,
                    count: 4,
                    avg_confidence: MetricValue::Value(0.8),
                    accuracy: MetricValue::Value(0.75),
                },
            ],
        };
        let svg = reliability_diagram(&cal);
        assert!(svg.starts_with("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
        assert_eq!(svg.matches("<circle").count(), 1);
        assert!(!svg.contains("insufficient_data"));
    }

    #[test]
    fn test_empty_inputs_still_render() {
        let cal = CalibrationMetrics {
            samples: 0,
            ece: MetricValue::INSUFFICIENT,
            brier: MetricValue::INSUFFICIENT,
            bins: Vec::new(),
        };
        assert!(reliability_diagram(&cal).contains("insufficient_data"));

        let sweep = sweep_thresholds(&[], &[], &[0.0, 0.5], &MatchConfig::default(), Objective::F1);
        let svg = threshold_curve(&sweep);
        assert!(svg.contains("insufficient_data"));
        assert!(svg.contains("</svg>"));
    }
}
