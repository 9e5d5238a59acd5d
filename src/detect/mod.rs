mod overlay;
mod result;

pub use overlay::{project, project_all, NormalizedRect, OverlayBox, SourceResolution};
pub use result::{
    parse_detection_event, BoundingBox, Detection, DetectionEvent, FrameMessage,
};
