//! RGBA frame buffers and the geometry that maps an on-screen guide onto them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer too short: {len} bytes for {width}x{height} RGBA")]
    ShortBuffer { len: usize, width: u32, height: u32 },
    #[error("crop region does not intersect the frame")]
    EmptyCrop,
}

/// Owned 8-bit RGBA frame, row-major, no padding between rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Borrowed RGBA pixels, the input of [`crate::gate::evaluate`].
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> FrameView<'a> {
    /// True when the view has no pixels or the buffer cannot hold them.
    pub fn is_degenerate(&self) -> bool {
        let needed = self.width as usize * self.height as usize * 4;
        needed == 0 || self.data.len() < needed
    }
}

impl RgbaFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if data.len() < width as usize * height as usize * 4 {
            return Err(FrameError::ShortBuffer {
                len: data.len(),
                width,
                height,
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// A frame where every pixel is `rgba`.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self {
            data,
            width,
            height,
        }
    }

    pub fn from_image(img: &image::DynamicImage) -> Self {
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            data: rgba.into_raw(),
            width,
            height,
        }
    }

    pub fn to_image(&self) -> Option<image::RgbaImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.data.clone())
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            data: &self.data,
            width: self.width,
            height: self.height,
        }
    }

    /// Copy out the pixels inside `rect`, clamped to the frame bounds.
    pub fn crop(&self, rect: CropRect) -> Result<RgbaFrame, FrameError> {
        let rect = rect
            .clamp_to(self.width, self.height)
            .ok_or(FrameError::EmptyCrop)?;

        let stride = self.width as usize * 4;
        let row_len = rect.width as usize * 4;
        let mut data = Vec::with_capacity(row_len * rect.height as usize);
        for row in rect.y..rect.y + rect.height {
            let start = row as usize * stride + rect.x as usize * 4;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Ok(RgbaFrame {
            data,
            width: rect.width,
            height: rect.height,
        })
    }
}

/// Pixel rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Intersect with a `width`×`height` frame. `None` if nothing is left.
    pub fn clamp_to(self, width: u32, height: u32) -> Option<CropRect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(CropRect {
            x: self.x,
            y: self.y,
            width: w,
            height: h,
        })
    }
}

/// A rectangle in display (CSS-pixel-like) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// The capture guide as fractions of the video frame (`0.0..=1.0`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuideRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// ISO/IEC 7810 ID-1 aspect ratio (85.60 mm × 53.98 mm): ID cards, licences.
pub const ID1_ASPECT: f32 = 85.60 / 53.98;
/// ISO/IEC 7810 ID-3 aspect ratio (125 mm × 88 mm): passport data page.
pub const ID3_ASPECT: f32 = 125.0 / 88.0;

impl GuideRect {
    pub const FULL: GuideRect = GuideRect {
        left: 0.0,
        top: 0.0,
        width: 1.0,
        height: 1.0,
    };

    /// A centred guide of the given aspect spanning `width_fraction` of the
    /// frame width, shrunk to fit if the frame is too short for it.
    pub fn centered(frame_width: u32, frame_height: u32, width_fraction: f32, aspect: f32) -> Self {
        if frame_width == 0 || frame_height == 0 || aspect <= 0.0 {
            return Self::FULL;
        }
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let mut w = fw * width_fraction.clamp(0.0, 1.0);
        let mut h = w / aspect;
        if h > fh {
            h = fh;
            w = h * aspect;
        }
        GuideRect {
            left: (fw - w) / 2.0 / fw,
            top: (fh - h) / 2.0 / fh,
            width: w / fw,
            height: h / fh,
        }
    }

    /// Pixel crop for a `width`×`height` frame.
    pub fn to_crop(&self, width: u32, height: u32) -> Option<CropRect> {
        let x = (self.left.max(0.0) * width as f32).floor() as u32;
        let y = (self.top.max(0.0) * height as f32).floor() as u32;
        let w = (self.width.max(0.0) * width as f32).floor() as u32;
        let h = (self.height.max(0.0) * height as f32).floor() as u32;
        CropRect {
            x,
            y,
            width: w,
            height: h,
        }
        .clamp_to(width, height)
    }

    /// Map an overlay drawn over a scaled video element onto the video's
    /// native pixel grid.
    pub fn crop_from_display(
        video_width: u32,
        video_height: u32,
        video_rect: ScreenRect,
        overlay_rect: ScreenRect,
    ) -> Option<CropRect> {
        if video_rect.width <= 0.0 || video_rect.height <= 0.0 {
            return None;
        }
        let scale_x = video_width as f64 / video_rect.width;
        let scale_y = video_height as f64 / video_rect.height;

        let x = ((overlay_rect.left - video_rect.left) * scale_x).max(0.0);
        let y = ((overlay_rect.top - video_rect.top) * scale_y).max(0.0);
        let w = (video_width as f64 - x).min(overlay_rect.width * scale_x);
        let h = (video_height as f64 - y).min(overlay_rect.height * scale_y);
        if w <= 0.0 || h <= 0.0 {
            return None;
        }

        CropRect {
            x: x.floor() as u32,
            y: y.floor() as u32,
            width: w.floor() as u32,
            height: h.floor() as u32,
        }
        .clamp_to(video_width, video_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_buffer_rejected() {
        let err = RgbaFrame::new(vec![0; 10], 2, 2).unwrap_err();
        assert!(matches!(err, FrameError::ShortBuffer { len: 10, .. }));
    }

    #[test]
    fn crop_copies_expected_pixels() {
        // 3x2 frame, red channel encodes the pixel index
        let mut data = Vec::new();
        for i in 0..6u8 {
            data.extend_from_slice(&[i, 0, 0, 255]);
        }
        let frame = RgbaFrame::new(data, 3, 2).unwrap();
        let sub = frame
            .crop(CropRect {
                x: 1,
                y: 0,
                width: 2,
                height: 2,
            })
            .unwrap();
        assert_eq!((sub.width, sub.height), (2, 2));
        let reds: Vec<u8> = sub.data.chunks(4).map(|p| p[0]).collect();
        assert_eq!(reds, vec![1, 2, 4, 5]);
    }

    #[test]
    fn crop_outside_frame_is_empty() {
        let frame = RgbaFrame::filled(4, 4, [0, 0, 0, 255]);
        let err = frame
            .crop(CropRect {
                x: 10,
                y: 0,
                width: 2,
                height: 2,
            })
            .unwrap_err();
        assert_eq!(err, FrameError::EmptyCrop);
    }

    #[test]
    fn crop_clamps_oversized_rect() {
        let rect = CropRect {
            x: 2,
            y: 2,
            width: 100,
            height: 100,
        };
        assert_eq!(
            rect.clamp_to(4, 3),
            Some(CropRect {
                x: 2,
                y: 2,
                width: 2,
                height: 1
            })
        );
    }

    #[test]
    fn centered_guide_keeps_aspect() {
        let guide = GuideRect::centered(1280, 720, 0.9, ID1_ASPECT);
        let crop = guide.to_crop(1280, 720).unwrap();
        let left_margin = crop.x;
        let right_margin = 1280 - (crop.x + crop.width);
        assert!(left_margin.abs_diff(right_margin) <= 1);
        let aspect = crop.width as f32 / crop.height as f32;
        assert!((aspect - ID1_ASPECT).abs() < 0.02);
    }

    #[test]
    fn centered_guide_shrinks_to_fit_short_frame() {
        // Very short frame: height limits the guide
        let guide = GuideRect::centered(1000, 100, 1.0, ID3_ASPECT);
        assert!(guide.height <= 1.0 + f32::EPSILON);
        assert!(guide.width < 1.0);
    }

    #[test]
    fn display_overlay_maps_to_video_pixels() {
        // Video shown at half its native size, overlay inset by 15px
        let video = ScreenRect {
            left: 0.0,
            top: 0.0,
            width: 640.0,
            height: 360.0,
        };
        let overlay = ScreenRect {
            left: 15.0,
            top: 80.0,
            width: 610.0,
            height: 200.0,
        };
        let crop = GuideRect::crop_from_display(1280, 720, video, overlay).unwrap();
        assert_eq!(
            crop,
            CropRect {
                x: 30,
                y: 160,
                width: 1220,
                height: 400
            }
        );
    }

    #[test]
    fn display_overlay_outside_video_is_none() {
        let video = ScreenRect {
            left: 0.0,
            top: 0.0,
            width: 0.0,
            height: 360.0,
        };
        let overlay = ScreenRect {
            left: 0.0,
            top: 0.0,
            width: 10.0,
            height: 10.0,
        };
        assert!(GuideRect::crop_from_display(1280, 720, video, overlay).is_none());
    }
}
