use std::path::Path;

use image::RgbaImage;
use tracing::debug;

use crate::error::{StoryError, StoryResult};
use crate::mux::VideoFrameSource;
use crate::story::maker::StorySettings;
use crate::story::page::{NormRect, StoryPage};

/// Synthesizes the video track one frame at a time.
///
/// Each page shows its still for the page window, panning and zooming
/// between the page's two normalized rectangles when enabled, letterboxed
/// into the output size over black. The first `cross_fade_us` of every page
/// blends with the previous page frozen at its final state. Captions render
/// bottom-centered with a drop shadow when a font is configured. Frames are
/// produced strictly in presentation order.
#[derive(Debug)]
pub struct StoryFrameDrawer {
    width: u32,
    height: u32,
    fps: u32,
    cross_fade_us: i64,
    show_pan_zoom: bool,
    show_text: bool,
    font: Option<fontdue::Font>,

    pages: Vec<PageLayout>,
    total_us: i64,
    frame_index: i64,
    current: usize,

    /// At most the current and previous page stills.
    images: Vec<(usize, RgbaImage)>,
    scratch: Vec<u8>,
    fade: Vec<u8>,
}

#[derive(Debug)]
struct PageLayout {
    page: StoryPage,
    start_us: i64,
    end_us: i64,
}

impl StoryFrameDrawer {
    pub fn new(settings: &StorySettings, pages: &[StoryPage]) -> StoryResult<Self> {
        if settings.width == 0 || settings.height == 0 {
            return Err(StoryError::setup_rejected(
                "frame width/height must be non-zero",
            ));
        }
        if !settings.width.is_multiple_of(2) || !settings.height.is_multiple_of(2) {
            // yuv420p output needs even dimensions.
            return Err(StoryError::setup_rejected(
                "frame width/height must be even",
            ));
        }
        if settings.fps == 0 {
            return Err(StoryError::setup_rejected("fps must be non-zero"));
        }
        if pages.is_empty() {
            return Err(StoryError::setup_rejected("drawer needs at least one page"));
        }

        let font = match &settings.caption_font {
            Some(path) => Some(load_font(path)?),
            None => None,
        };

        let mut layouts = Vec::with_capacity(pages.len());
        let mut start_us = 0i64;
        for page in pages {
            let end_us = start_us + page.duration_us(settings.transition_us);
            layouts.push(PageLayout {
                page: page.clone(),
                start_us,
                end_us,
            });
            start_us = end_us;
        }

        let frame_bytes = (settings.width * settings.height * 4) as usize;
        Ok(Self {
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
            cross_fade_us: settings.cross_fade_us,
            show_pan_zoom: settings.show_pan_zoom,
            show_text: settings.show_text,
            font,
            pages: layouts,
            total_us: start_us,
            frame_index: 0,
            current: 0,
            images: Vec::new(),
            scratch: vec![0; frame_bytes],
            fade: vec![0; frame_bytes],
        })
    }

    pub fn total_us(&self) -> i64 {
        self.total_us
    }

    fn image_for(&mut self, index: usize) -> StoryResult<Option<usize>> {
        if self.pages[index].page.image.is_none() {
            return Ok(None);
        }
        if let Some(pos) = self.images.iter().position(|(i, _)| *i == index) {
            return Ok(Some(pos));
        }
        let path = self.pages[index]
            .page
            .image
            .clone()
            .unwrap_or_default();
        let img = image::open(&path)
            .map_err(|e| StoryError::decode(format!("cannot load '{}': {e}", path.display())))?
            .to_rgba8();
        debug!(path = %path.display(), "page still loaded");
        // Keep only stills a cross-fade can still reference.
        self.images.retain(|(i, _)| i + 1 >= index);
        self.images.push((index, img));
        Ok(Some(self.images.len() - 1))
    }

    /// Render page `index` at absolute time `pts_us` into `out`.
    fn render_page(&mut self, index: usize, pts_us: i64, mut out: Vec<u8>) -> StoryResult<Vec<u8>> {
        out.fill(0);

        let slot = self.image_for(index)?;
        let layout = &self.pages[index];
        let span = (layout.end_us - layout.start_us).max(1);
        let t = (pts_us - layout.start_us) as f32 / span as f32;
        let rect = match (&layout.page.pan_zoom, self.show_pan_zoom) {
            (Some(pz), true) => pz.at(t),
            _ => NormRect::FULL,
        };

        if let Some(slot) = slot {
            let img = &self.images[slot].1;
            blit_rect(&mut out, self.width, self.height, img, rect);
        }

        if self.show_text {
            if let (Some(font), Some(text)) = (&self.font, &self.pages[index].page.text) {
                draw_caption(&mut out, self.width, self.height, font, text);
            }
        }
        Ok(out)
    }
}

impl VideoFrameSource for StoryFrameDrawer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn next_frame(&mut self) -> StoryResult<Option<&[u8]>> {
        let pts_us = self.frame_index * 1_000_000 / i64::from(self.fps);
        if pts_us >= self.total_us {
            return Ok(None);
        }
        while pts_us >= self.pages[self.current].end_us {
            self.current += 1;
        }
        let current = self.current;

        let scratch = std::mem::take(&mut self.scratch);
        self.scratch = self.render_page(current, pts_us, scratch)?;

        let fade_in = pts_us - self.pages[current].start_us;
        if current > 0 && self.cross_fade_us > 0 && fade_in < self.cross_fade_us {
            // Previous page holds its final state under the incoming one.
            let prev_end = self.pages[current - 1].end_us;
            let fade = std::mem::take(&mut self.fade);
            self.fade = self.render_page(current - 1, prev_end, fade)?;
            let alpha = fade_in as f32 / self.cross_fade_us as f32;
            blend_into(&mut self.scratch, &self.fade, alpha);
        }

        self.frame_index += 1;
        Ok(Some(&self.scratch))
    }
}

fn load_font(path: &Path) -> StoryResult<fontdue::Font> {
    let bytes = std::fs::read(path).map_err(|e| {
        StoryError::setup_rejected(format!("cannot read font '{}': {e}", path.display()))
    })?;
    fontdue::Font::from_bytes(bytes, fontdue::FontSettings::default()).map_err(|e| {
        StoryError::setup_rejected(format!("cannot parse font '{}': {e}", path.display()))
    })
}

/// Fit the normalized source rectangle of `img` into the output, centered
/// over black, sampling bilinearly.
fn blit_rect(out: &mut [u8], out_w: u32, out_h: u32, img: &RgbaImage, rect: NormRect) {
    let (iw, ih) = (img.width() as f32, img.height() as f32);
    let sx = rect.x.clamp(0.0, 1.0) * iw;
    let sy = rect.y.clamp(0.0, 1.0) * ih;
    let sw = (rect.w * iw).max(1.0).min(iw - sx);
    let sh = (rect.h * ih).max(1.0).min(ih - sy);

    let scale = (out_w as f32 / sw).min(out_h as f32 / sh);
    let dw = (sw * scale).round() as u32;
    let dh = (sh * scale).round() as u32;
    let ox = (out_w - dw.min(out_w)) / 2;
    let oy = (out_h - dh.min(out_h)) / 2;

    for y in 0..dh.min(out_h) {
        for x in 0..dw.min(out_w) {
            let u = sx + (x as f32 + 0.5) / scale;
            let v = sy + (y as f32 + 0.5) / scale;
            let px = sample_bilinear(img, u, v);
            let o = (((oy + y) * out_w + ox + x) * 4) as usize;
            out[o..o + 4].copy_from_slice(&px);
        }
    }
}

fn sample_bilinear(img: &RgbaImage, u: f32, v: f32) -> [u8; 4] {
    let max_x = img.width() - 1;
    let max_y = img.height() - 1;
    let x = (u - 0.5).max(0.0);
    let y = (v - 0.5).max(0.0);
    let x0 = (x as u32).min(max_x);
    let y0 = (y as u32).min(max_y);
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0).0;
    let p10 = img.get_pixel(x1, y0).0;
    let p01 = img.get_pixel(x0, y1).0;
    let p11 = img.get_pixel(x1, y1).0;

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = f32::from(p00[c]) * (1.0 - fx) + f32::from(p10[c]) * fx;
        let bot = f32::from(p01[c]) * (1.0 - fx) + f32::from(p11[c]) * fx;
        out[c] = (top * (1.0 - fy) + bot * fy).round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// `alpha` = 1 shows `dst` alone, 0 shows `under` alone.
fn blend_into(dst: &mut [u8], under: &[u8], alpha: f32) {
    let a = alpha.clamp(0.0, 1.0);
    for (d, u) in dst.iter_mut().zip(under.iter()) {
        *d = (f32::from(*d) * a + f32::from(*u) * (1.0 - a)).round() as u8;
    }
}

fn draw_caption(out: &mut [u8], out_w: u32, out_h: u32, font: &fontdue::Font, text: &str) {
    let px = (out_h as f32 / 15.0).max(8.0);
    let total_width: f32 = text
        .chars()
        .map(|ch| font.metrics(ch, px).advance_width)
        .sum();
    let start_x = ((out_w as f32 - total_width) / 2.0).max(0.0);
    let baseline = out_h as f32 - out_h as f32 / 10.0;

    // Shadow first, then the text itself.
    draw_text_run(out, out_w, out_h, font, text, px, start_x + 2.0, baseline + 2.0, [0, 0, 0]);
    draw_text_run(out, out_w, out_h, font, text, px, start_x, baseline, [255, 255, 255]);
}

fn draw_text_run(
    out: &mut [u8],
    out_w: u32,
    out_h: u32,
    font: &fontdue::Font,
    text: &str,
    px: f32,
    start_x: f32,
    baseline: f32,
    color: [u8; 3],
) {
    let mut pen_x = start_x;
    for ch in text.chars() {
        let (metrics, coverage) = font.rasterize(ch, px);
        let gx = (pen_x + metrics.xmin as f32).round() as i64;
        let gy = (baseline - metrics.height as f32 - metrics.ymin as f32).round() as i64;
        for row in 0..metrics.height {
            for col in 0..metrics.width {
                let x = gx + col as i64;
                let y = gy + row as i64;
                if x < 0 || y < 0 || x >= i64::from(out_w) || y >= i64::from(out_h) {
                    continue;
                }
                let cov = f32::from(coverage[row * metrics.width + col]) / 255.0;
                if cov <= 0.0 {
                    continue;
                }
                let o = ((y as u32 * out_w + x as u32) * 4) as usize;
                for c in 0..3 {
                    let cur = f32::from(out[o + c]);
                    out[o + c] =
                        (cur * (1.0 - cov) + f32::from(color[c]) * cov).round() as u8;
                }
                out[o + 3] = 255;
            }
        }
        pen_x += metrics.advance_width;
    }
}
