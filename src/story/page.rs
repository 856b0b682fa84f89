use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Normalized rectangle over a source image, all components in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl NormRect {
    pub const FULL: NormRect = NormRect {
        x: 0.0,
        y: 0.0,
        w: 1.0,
        h: 1.0,
    };

    pub fn lerp(a: NormRect, b: NormRect, t: f32) -> NormRect {
        let t = t.clamp(0.0, 1.0);
        NormRect {
            x: a.x + (b.x - a.x) * t,
            y: a.y + (b.y - a.y) * t,
            w: a.w + (b.w - a.w) * t,
            h: a.h + (b.h - a.h) * t,
        }
    }
}

/// Ken Burns motion: the visible source rectangle glides from `start` to
/// `end` over the page's duration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PanZoom {
    pub start: NormRect,
    pub end: NormRect,
}

impl PanZoom {
    /// Rectangle at normalized page progress `t`.
    pub fn at(&self, t: f32) -> NormRect {
        NormRect::lerp(self.start, self.end, t)
    }
}

/// One page of a story: a still image with narration, optional soundtrack,
/// caption text and camera motion.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryPage {
    /// Still shown for the whole page. `None` renders black.
    pub image: Option<PathBuf>,
    /// Narration clip. `None` plays silence for the declared duration.
    pub narration: Option<PathBuf>,
    /// How long the narration window lasts. The CLI fills this from the
    /// clip itself when the manifest leaves it at zero.
    pub narration_duration_us: i64,
    /// Background music starting on this page. Contiguous pages naming the
    /// same file share one continuous playback.
    pub soundtrack: Option<PathBuf>,
    /// Caption rendered over the lower part of the frame.
    pub text: Option<String>,
    pub pan_zoom: Option<PanZoom>,
}

impl StoryPage {
    /// Full on-screen window of the page: transition pad plus narration.
    pub fn duration_us(&self, transition_us: i64) -> i64 {
        transition_us + self.narration_duration_us
    }
}
