//! Camera classification, suitability ranking and device pinning.
//!
//! Platforms report capture devices as an opaque id plus a free-text label.
//! Everything here works from the label alone: sensors that are useless for
//! a colour capture (IR, depth, time-of-flight) are dropped, the rest are
//! sorted by how well they match the preferred facing.

use serde::{Deserialize, Serialize};

/// Label tokens that mark a sensor unsuitable for colour capture.
pub const BLOCKED_SENSOR_TOKENS: &[&str] = &["infrared", "ir", "depth", "tof", "true depth", "biometric"];

const BACK_TOKENS: &[&str] = &["back", "rear", "environment", "world"];
const FRONT_TOKENS: &[&str] = &["front", "user", "self", "webcam"];

const SCORE_PREFERRED: i32 = 100;
const SCORE_UNKNOWN: i32 = 50;
const SCORE_OTHER: i32 = 20;
const SCORE_BLOCKED_PENALTY: i32 = -1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Front,
    Back,
    Unknown,
}

/// A device as the platform reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
    pub classification: Facing,
    pub suitability_score: i32,
}

/// True if the label names an IR, depth, ToF or biometric sensor.
///
/// Tokens of four letters or more match anywhere in the label ("TrueDepth"),
/// shorter ones only as whole words so that "Mirror" or "Tofu Cam" pass.
pub fn is_blocked_sensor(label: &str) -> bool {
    let lower = label.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let normalized = words.join(" ");

    BLOCKED_SENSOR_TOKENS.iter().any(|token| {
        if token.len() >= 4 {
            normalized.contains(token) || normalized.replace(' ', "").contains(&token.replace(' ', ""))
        } else {
            words.iter().any(|w| w == token)
        }
    })
}

/// Facing guessed from label keywords. Rear keywords win over front ones.
pub fn classify(label: &str) -> Facing {
    let lower = label.to_lowercase();
    if BACK_TOKENS.iter().any(|t| lower.contains(t)) {
        Facing::Back
    } else if FRONT_TOKENS.iter().any(|t| lower.contains(t)) {
        Facing::Front
    } else {
        Facing::Unknown
    }
}

pub fn suitability_score(label: &str, preferred: Facing) -> i32 {
    let facing = classify(label);
    let base = if facing == preferred {
        SCORE_PREFERRED
    } else if facing == Facing::Unknown {
        SCORE_UNKNOWN
    } else {
        SCORE_OTHER
    };
    if is_blocked_sensor(label) {
        base + SCORE_BLOCKED_PENALTY
    } else {
        base
    }
}

pub fn describe(raw: RawDevice, preferred: Facing) -> DeviceDescriptor {
    let label = if raw.label.trim().is_empty() {
        "Camera".to_string()
    } else {
        raw.label
    };
    DeviceDescriptor {
        classification: classify(&label),
        suitability_score: suitability_score(&label, preferred),
        id: raw.id,
        label,
    }
}

/// Drop blocked sensors and sort the rest by descending suitability.
/// Ties keep platform order.
pub fn rank_devices(raw: Vec<RawDevice>, preferred: Facing) -> Vec<DeviceDescriptor> {
    let mut devices: Vec<DeviceDescriptor> = raw
        .into_iter()
        .filter(|d| !is_blocked_sensor(&d.label))
        .map(|d| describe(d, preferred))
        .collect();
    devices.sort_by(|a, b| b.suitability_score.cmp(&a.suitability_score));
    devices
}

/// The device to flip to: the first rear camera unless the current one is
/// already rear-facing, in which case the first front camera.
pub fn switch_facing<'a>(
    current: Option<&str>,
    devices: &'a [DeviceDescriptor],
) -> Option<&'a DeviceDescriptor> {
    let current_facing = current
        .and_then(|id| devices.iter().find(|d| d.id == id))
        .map(|d| d.classification);
    let target = if current_facing == Some(Facing::Back) {
        Facing::Front
    } else {
        Facing::Back
    };
    devices.iter().find(|d| d.classification == target)
}

/// Video constraint for a stream request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeviceConstraint {
    /// Only this device id is acceptable.
    Exact(String),
    /// Any device, preferably with this facing.
    IdealFacing(Facing),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub video: DeviceConstraint,
    pub audio: bool,
}

/// Remembers the selected device for the rest of a capture session and
/// builds every stream request from it.
#[derive(Debug, Clone, Default)]
pub struct DevicePin {
    pinned: Option<String>,
}

impl DevicePin {
    pub fn pin(&mut self, device_id: impl Into<String>) {
        self.pinned = Some(device_id.into());
    }

    pub fn clear(&mut self) {
        self.pinned = None;
    }

    pub fn pinned(&self) -> Option<&str> {
        self.pinned.as_deref()
    }

    /// A pinned device always wins over the generic `fallback` facing.
    pub fn request(&self, fallback: Facing) -> StreamRequest {
        let video = match &self.pinned {
            Some(id) => DeviceConstraint::Exact(id.clone()),
            None => DeviceConstraint::IdealFacing(fallback),
        };
        StreamRequest {
            video,
            audio: false,
        }
    }
}
