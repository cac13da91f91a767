//! `idgate gate`: run the frame quality gate over a still image.

use std::path::Path;

use anyhow::{Context, Result};
use idgate_core::document::guide_aspect;
use idgate_core::gate::{self, GateProfile};
use idgate_core::{GuideRect, RgbaFrame};

/// Same guide width the daemon's capture loop uses.
const GUIDE_WIDTH_FRACTION: f32 = 0.9;

pub fn run(path: &Path, profile: &str, kind: Option<&str>) -> Result<()> {
    let profile: GateProfile = profile.parse()?;
    let img = image::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let frame = RgbaFrame::from_image(&img);

    let region = match kind {
        Some(kind) => crop_to_guide(&frame, kind)?,
        None => frame,
    };

    let report = gate::evaluate_detailed(region.view(), &profile.config());
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.verdict.accepted {
        println!("accepted");
    } else {
        println!("rejected");
    }
    Ok(())
}

fn crop_to_guide(frame: &RgbaFrame, kind: &str) -> Result<RgbaFrame> {
    let guide = GuideRect::centered(frame.width, frame.height, GUIDE_WIDTH_FRACTION, guide_aspect(kind));
    let rect = guide
        .to_crop(frame.width, frame.height)
        .context("guide does not fit the image")?;
    Ok(frame.crop(rect)?)
}
