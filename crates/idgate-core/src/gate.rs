//! Per-frame document quality gate.
//!
//! Decides from raw pixels whether the region inside the capture guide is
//! good enough to submit. The gate looks at four signals on a 2-px sampling
//! grid:
//!
//! - **Brightness**: mean Rec. 709 luma, normalised to `0..=1`.
//! - **Sharpness**: mean absolute luma difference between neighbouring
//!   samples.
//! - **Glare**: share of samples brighter than a near-white cutoff.
//! - **Framing**: density of edge samples along a border ring, measured flush
//!   with the guide and again inset by a fraction of the short side. Four
//!   inset corner patches act as a fallback for a card sitting centred inside
//!   the guide without touching it.
//!
//! The combinator deliberately tolerates one weak signal, trading a little
//! precision on borderline frames for fewer rejections under uneven light.
//!
//! Evaluation is pure and allocation-free; a 2 MP region is a few million
//! arithmetic operations, well inside a 60 Hz frame budget.

use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::FrameView;

/// Sampling step in both axes.
pub const SAMPLE_STRIDE: usize = 2;

/// Luma above which a sample counts as specular glare.
const GLARE_LUMA: f32 = 245.0;

/// Edge density a single corner patch must exceed to satisfy framing.
const CORNER_MIN_DENSITY: f32 = 0.09;

/// Corner patch side as a fraction of the short side, with a pixel floor.
const CORNER_RATIO: f32 = 0.08;
const CORNER_MIN_PX: usize = 10;

/// Share of the coverage target that still counts as "nearly framed".
const NEAR_FRAMED_RATIO: f32 = 0.90;

/// Share of `min_sharpness` the framed-only fallback still demands.
const FRAMED_FALLBACK_SHARPNESS: f32 = 0.75;

#[derive(Error, Debug, PartialEq)]
pub enum GateConfigError {
    #[error("brightness window is empty: min {min} >= max {max}")]
    BrightnessWindow { min: f32, max: f32 },
    #[error("{name} must be within 0..=1, got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },
    #[error("min_sharpness must be non-negative, got {0}")]
    NegativeSharpness(f32),
    #[error("unknown gate profile '{0}' (expected 'baseline' or 'loose')")]
    UnknownProfile(String),
}

/// Gate thresholds. Missing fields in a serialized override fall back to the
/// baseline profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum ring edge density for the guide to count as filled.
    pub min_framing_coverage: f32,
    /// Minimum mean luma gradient (0..255 scale).
    pub min_sharpness: f32,
    /// Maximum share of near-white samples.
    pub max_glare_fraction: f32,
    /// Exclusive lower bound on normalised mean luma.
    pub min_brightness: f32,
    /// Exclusive upper bound on normalised mean luma.
    pub max_brightness: f32,
    /// Ring thickness in pixels. `None` derives 2.5% of the short side,
    /// clamped to 3..=12.
    pub ring_thickness_px: Option<u32>,
    /// Inner ring inset as a fraction of the short side.
    pub inset_ratio: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::baseline()
    }
}

impl GateConfig {
    pub const fn baseline() -> Self {
        Self {
            min_framing_coverage: 0.30,
            min_sharpness: 4.0,
            max_glare_fraction: 0.16,
            min_brightness: 0.14,
            max_brightness: 0.94,
            ring_thickness_px: None,
            inset_ratio: 0.08,
        }
    }

    /// The profile used by the live capture screen: demands a well-filled
    /// guide and less glare, accepts a slightly narrower brightness window.
    pub const fn loose() -> Self {
        Self {
            min_framing_coverage: 0.64,
            min_sharpness: 5.6,
            max_glare_fraction: 0.072,
            min_brightness: 0.20,
            max_brightness: 0.92,
            ring_thickness_px: None,
            inset_ratio: 0.08,
        }
    }

    pub fn validate(&self) -> Result<(), GateConfigError> {
        if self.min_brightness >= self.max_brightness {
            return Err(GateConfigError::BrightnessWindow {
                min: self.min_brightness,
                max: self.max_brightness,
            });
        }
        for (name, value) in [
            ("min_framing_coverage", self.min_framing_coverage),
            ("max_glare_fraction", self.max_glare_fraction),
            ("min_brightness", self.min_brightness),
            ("max_brightness", self.max_brightness),
            ("inset_ratio", self.inset_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GateConfigError::OutOfUnitRange { name, value });
            }
        }
        if self.min_sharpness < 0.0 {
            return Err(GateConfigError::NegativeSharpness(self.min_sharpness));
        }
        Ok(())
    }
}

/// Named threshold sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateProfile {
    #[default]
    Baseline,
    Loose,
}

impl GateProfile {
    pub fn config(self) -> GateConfig {
        match self {
            GateProfile::Baseline => GateConfig::baseline(),
            GateProfile::Loose => GateConfig::loose(),
        }
    }
}

impl FromStr for GateProfile {
    type Err = GateConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(GateProfile::Baseline),
            "loose" => Ok(GateProfile::Loose),
            other => Err(GateConfigError::UnknownProfile(other.to_string())),
        }
    }
}

/// Outcome for a single frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    /// Max of outer and inner ring edge density, `0..=1`.
    pub framing_score: f32,
    pub brightness_ok: bool,
    pub glare_ok: bool,
    pub sharp_ok: bool,
    pub accepted: bool,
}

/// Raw measurements behind a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GateMetrics {
    pub brightness: f32,
    pub avg_gradient: f32,
    pub glare_fraction: f32,
    pub outer_ring_density: f32,
    pub inner_ring_density: f32,
    /// Top-left, top-right, bottom-left, bottom-right.
    pub corner_densities: [f32; 4],
    /// Framing satisfied by ring coverage or a corner patch.
    pub framed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GateReport {
    pub verdict: QualityVerdict,
    pub metrics: GateMetrics,
}

/// Evaluate one guide-cropped RGBA region.
pub fn evaluate(frame: FrameView<'_>, config: &GateConfig) -> QualityVerdict {
    evaluate_detailed(frame, config).verdict
}

/// Like [`evaluate`], also returning the measurements.
pub fn evaluate_detailed(frame: FrameView<'_>, config: &GateConfig) -> GateReport {
    if frame.is_degenerate() {
        return GateReport::default();
    }

    let s = Sampler {
        px: frame.data,
        w: frame.width as usize,
        h: frame.height as usize,
    };

    // Global pass: brightness, gradient and glare share one sweep.
    let mut sum_luma = 0.0f64;
    let mut count = 0usize;
    let mut grad_sum = 0.0f64;
    let mut grad_n = 0usize;
    let mut whites = 0usize;
    for y in (0..s.h).step_by(SAMPLE_STRIDE) {
        for x in (0..s.w).step_by(SAMPLE_STRIDE) {
            let l = s.luma(x, y);
            sum_luma += l as f64;
            count += 1;
            if l > GLARE_LUMA {
                whites += 1;
            }
            if x + SAMPLE_STRIDE < s.w {
                grad_sum += (l - s.luma(x + SAMPLE_STRIDE, y)).abs() as f64;
                grad_n += 1;
            }
            if y + SAMPLE_STRIDE < s.h {
                grad_sum += (l - s.luma(x, y + SAMPLE_STRIDE)).abs() as f64;
                grad_n += 1;
            }
        }
    }

    let brightness = if count > 0 {
        (sum_luma / count as f64 / 255.0) as f32
    } else {
        0.0
    };
    let avg_gradient = if grad_n > 0 {
        (grad_sum / grad_n as f64) as f32
    } else {
        0.0
    };
    let glare_fraction = if count > 0 {
        whites as f32 / count as f32
    } else {
        1.0
    };

    let brightness_ok = brightness > config.min_brightness && brightness < config.max_brightness;
    let sharp_ok = avg_gradient > config.min_sharpness;
    let glare_ok = glare_fraction < config.max_glare_fraction;

    // Framing
    let edge_threshold = (avg_gradient * 0.8 + 6.0).max(6.0);
    let short = s.w.min(s.h);
    let inset = (short as f32 * config.inset_ratio).floor().max(0.0) as usize;
    let ring = config
        .ring_thickness_px
        .map(|px| px as usize)
        .unwrap_or_else(|| ((short as f32 * 0.025).floor() as usize).clamp(3, 12))
        .min(short / 3);

    let outer_ring_density = s.ring_density(0, ring, edge_threshold);
    let inner_ring_density = s.ring_density(inset, ring, edge_threshold);
    let framing_score = outer_ring_density.max(inner_ring_density);

    let corner = ((short as f32 * CORNER_RATIO).floor() as usize).max(CORNER_MIN_PX);
    let far_x = s.w.saturating_sub(inset + corner);
    let far_y = s.h.saturating_sub(inset + corner);
    let corner_densities = [
        s.corner_density(inset, inset, corner, edge_threshold),
        s.corner_density(far_x, inset, corner, edge_threshold),
        s.corner_density(inset, far_y, corner, edge_threshold),
        s.corner_density(far_x, far_y, corner, edge_threshold),
    ];
    let corner_hit = corner_densities.iter().any(|&d| d > CORNER_MIN_DENSITY);

    let framed = framing_score >= config.min_framing_coverage || corner_hit;
    let nearly_framed =
        framing_score >= config.min_framing_coverage * NEAR_FRAMED_RATIO || corner_hit;

    let passes = [brightness_ok, glare_ok, sharp_ok, framed]
        .iter()
        .filter(|&&ok| ok)
        .count();

    let accepted = passes >= 3
        || (brightness_ok && glare_ok && (framed || nearly_framed))
        || (framed && avg_gradient > config.min_sharpness * FRAMED_FALLBACK_SHARPNESS);

    GateReport {
        verdict: QualityVerdict {
            framing_score,
            brightness_ok,
            glare_ok,
            sharp_ok,
            accepted,
        },
        metrics: GateMetrics {
            brightness,
            avg_gradient,
            glare_fraction,
            outer_ring_density,
            inner_ring_density,
            corner_densities,
            framed,
        },
    }
}

struct Sampler<'a> {
    px: &'a [u8],
    w: usize,
    h: usize,
}

impl Sampler<'_> {
    #[inline]
    fn luma(&self, x: usize, y: usize) -> f32 {
        let i = (y * self.w + x) * 4;
        self.px[i] as f32 * 0.2126 + self.px[i + 1] as f32 * 0.7152 + self.px[i + 2] as f32 * 0.0722
    }

    /// Mean of the right and down neighbour differences that exist.
    #[inline]
    fn is_edge(&self, x: usize, y: usize, threshold: f32) -> bool {
        let l = self.luma(x, y);
        let mut g = 0.0;
        let mut m = 0u32;
        if x + SAMPLE_STRIDE < self.w {
            g += (l - self.luma(x + SAMPLE_STRIDE, y)).abs();
            m += 1;
        }
        if y + SAMPLE_STRIDE < self.h {
            g += (l - self.luma(x, y + SAMPLE_STRIDE)).abs();
            m += 1;
        }
        m > 0 && g / m as f32 > threshold
    }

    /// Tally edge samples in a rectangle, clamped to the buffer.
    fn tally(&self, xs: Range<usize>, ys: Range<usize>, threshold: f32) -> (usize, usize) {
        let xs = xs.start..xs.end.min(self.w);
        let ys = ys.start..ys.end.min(self.h);
        let mut hits = 0;
        let mut total = 0;
        for y in ys.step_by(SAMPLE_STRIDE) {
            for x in xs.clone().step_by(SAMPLE_STRIDE) {
                if self.is_edge(x, y, threshold) {
                    hits += 1;
                }
                total += 1;
            }
        }
        (hits, total)
    }

    /// Edge density of a `ring`-px border inset by `inset` px on every side.
    fn ring_density(&self, inset: usize, ring: usize, threshold: f32) -> f32 {
        let span_x = inset..self.w.saturating_sub(inset);
        let span_y = inset..self.h.saturating_sub(inset);

        let bands = [
            // top, bottom
            (span_x.clone(), inset..inset + ring),
            (
                span_x,
                self.h.saturating_sub(inset + ring)..self.h.saturating_sub(inset),
            ),
            // left, right
            (inset..inset + ring, span_y.clone()),
            (
                self.w.saturating_sub(inset + ring)..self.w.saturating_sub(inset),
                span_y,
            ),
        ];

        let (hits, total) = bands
            .into_iter()
            .map(|(xs, ys)| self.tally(xs, ys, threshold))
            .fold((0, 0), |(h, t), (dh, dt)| (h + dh, t + dt));

        if total == 0 {
            0.0
        } else {
            hits as f32 / total as f32
        }
    }

    fn corner_density(&self, x0: usize, y0: usize, size: usize, threshold: f32) -> f32 {
        let (hits, total) = self.tally(x0..x0 + size, y0..y0 + size, threshold);
        if total == 0 {
            0.0
        } else {
            hits as f32 / total as f32
        }
    }
}
