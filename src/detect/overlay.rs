//! Projection of detection boxes onto a rendered viewport.
//!
//! Boxes arrive in source-frame pixels. The viewport may be any size, so
//! overlays are expressed as fractions (0..1) of the source frame and the
//! renderer multiplies by whatever it is drawing into.
//!
//! The source resolution must be the one the frame was captured at. A wrong
//! resolution scales the overlay silently; it does not fail.

use anyhow::{anyhow, Result};

use super::result::Detection;

/// Capture resolution agreed with the detection service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceResolution {
    width: u32,
    height: u32,
}

impl SourceResolution {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!(
                "source resolution must be non-zero (got {}x{})",
                width,
                height
            ));
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// True when a captured frame matches this resolution.
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

impl Default for SourceResolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl std::fmt::Display for SourceResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Viewport-relative rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NormalizedRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// A projected detection, ready to draw.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayBox {
    pub rect: NormalizedRect,
    pub label: String,
}

pub fn project(detection: &Detection, resolution: SourceResolution) -> NormalizedRect {
    let w = resolution.width as f64;
    let h = resolution.height as f64;
    let bbox = &detection.bbox;
    NormalizedRect {
        left: bbox.x / w,
        top: bbox.y / h,
        width: bbox.width / w,
        height: bbox.height / h,
    }
}

/// Project every detection of one event, preserving the event's order.
pub fn project_all(detections: &[Detection], resolution: SourceResolution) -> Vec<OverlayBox> {
    detections
        .iter()
        .map(|detection| OverlayBox {
            rect: project(detection, resolution),
            label: detection.label(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn face(x: f64, y: f64, width: f64, height: f64) -> Detection {
        Detection {
            bbox: BoundingBox {
                x,
                y,
                width,
                height,
            },
            age: "42".to_string(),
            gender: "Male".to_string(),
            confidence: 0.9,
            timestamp: None,
        }
    }

    #[test]
    fn projects_against_source_resolution() {
        let res = SourceResolution::new(640, 480).unwrap();
        let rect = project(&face(160.0, 120.0, 320.0, 240.0), res);
        assert_eq!(
            rect,
            NormalizedRect {
                left: 0.25,
                top: 0.25,
                width: 0.5,
                height: 0.5
            }
        );
    }

    #[test]
    fn projection_is_scale_invariant() {
        let small = SourceResolution::new(640, 480).unwrap();
        let large = SourceResolution::new(1280, 960).unwrap();
        for (x, y, w, h) in [
            (0.0, 0.0, 640.0, 480.0),
            (13.0, 7.0, 31.0, 45.0),
            (600.0, 400.0, 40.0, 80.0),
        ] {
            let a = project(&face(x, y, w, h), small);
            let b = project(&face(x * 2.0, y * 2.0, w * 2.0, h * 2.0), large);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn empty_event_projects_nothing() {
        assert!(project_all(&[], SourceResolution::default()).is_empty());
    }

    #[test]
    fn project_all_keeps_event_order_and_labels() {
        let boxes = project_all(
            &[face(320.0, 0.0, 10.0, 10.0), face(0.0, 0.0, 10.0, 10.0)],
            SourceResolution::default(),
        );
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].rect.left, 0.5);
        assert_eq!(boxes[1].rect.left, 0.0);
        assert_eq!(boxes[0].label, "Male, 42 (90%)");
    }

    #[test]
    fn mismatched_resolution_scales_without_failing() {
        let rect = project(&face(1280.0, 0.0, 64.0, 48.0), SourceResolution::default());
        assert_eq!(rect.left, 2.0);
        assert!(rect.width > 0.0);
    }

    #[test]
    fn zero_resolution_rejected() {
        assert!(SourceResolution::new(0, 480).is_err());
        assert!(SourceResolution::new(640, 0).is_err());
    }
}
