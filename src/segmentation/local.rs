//! Service-free background removal.
//!
//! The photo is decoded in-process, masked in memory and written back out as
//! a PNG with an alpha channel.
use super::{SegmentationStrategy, SourceImage};
use crate::model::{SegmentationMethod, SegmentationOutcome};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder};
use std::collections::VecDeque;
use std::path::Path;
use tracing::debug;

/// Largest edge we mask at; bigger photos are scaled down first.
const MAX_EDGE: u32 = 1024;
/// Euclidean RGB distance still counted as background.
const COLOR_TOLERANCE: f64 = 48.0;
/// Sobel magnitude on luma that counts as an outline.
const EDGE_THRESHOLD: f64 = 64.0;
const MIN_FOREGROUND: f64 = 0.02;
const MAX_FOREGROUND: f64 = 0.98;
/// Share of each axis the fallback ellipse spans.
const ELLIPSE_SPAN: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskSource {
    BorderFill,
    Edges,
    Ellipse,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    pub foreground: Vec<bool>,
    pub source: MaskSource,
}

impl Mask {
    pub fn foreground_ratio(&self) -> f64 {
        ratio(&self.foreground)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalHeuristic;

impl LocalHeuristic {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SegmentationStrategy for LocalHeuristic {
    fn name(&self) -> &'static str {
        "local_heuristic"
    }

    fn method(&self) -> SegmentationMethod {
        SegmentationMethod::Local
    }

    async fn segment(&self, source: &SourceImage, out_dir: &Path) -> Result<SegmentationOutcome> {
        let bytes = source.bytes.clone();
        let order_id = source.order_id;
        let png = tokio::task::spawn_blocking(move || cut_out(order_id, &bytes))
            .await
            .context("local segmentation task panicked")??;

        let path = out_dir.join(format!("{}-{}.png", source.order_id, uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &png)
            .await
            .with_context(|| format!("failed to write cutout {}", path.display()))?;
        Ok(SegmentationOutcome {
            method: self.method(),
            path,
            bytes: png.len() as u64,
        })
    }
}

/// Decode, mask and re-encode as PNG.
fn cut_out(order_id: i64, photo: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = image::load_from_memory(photo).context("failed to decode photo")?;
    if decoded.width().max(decoded.height()) > MAX_EDGE {
        decoded = decoded.resize(MAX_EDGE, MAX_EDGE, FilterType::Triangle);
    }
    let raster = decoded.to_rgba8();
    let (width, height) = (raster.width() as usize, raster.height() as usize);
    let mut rgba = raster.into_raw();

    let mask = compute_mask(&rgba, width, height)?;
    debug!(
        order_id,
        width,
        height,
        source = ?mask.source,
        foreground = mask.foreground_ratio(),
        "computed local mask"
    );
    apply_alpha(&mut rgba, &mask);
    encode_png(&rgba, width as u32, height as u32)
}

fn encode_png(rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(rgba, width, height, ExtendedColorType::Rgba8)
        .context("failed to encode cutout")?;
    Ok(buf)
}

/// Build a foreground mask for an RGBA raster.
///
/// Three attempts, first plausible split wins:
/// 1. background is whatever is connected to the frame border and close to
///    the median border colour;
/// 2. background is whatever the border reaches without crossing a Sobel
///    outline, which separates subjects close in colour to the backdrop;
/// 3. a centered ellipse.
///
/// The result is smoothed with a 3x3 majority vote.
pub fn compute_mask(rgba: &[u8], width: usize, height: usize) -> Result<Mask> {
    if width == 0 || height == 0 || rgba.len() != width * height * 4 {
        bail!("raster of {} bytes does not match {}x{} RGBA", rgba.len(), width, height);
    }
    let background = border_color(rgba, width, height);
    let by_color = flood_background(width, height, |x, y| close_to(pixel(rgba, width, x, y), background));

    let (foreground, source) = if plausible(&by_color) {
        (by_color, MaskSource::BorderFill)
    } else {
        let edges = dilate(&sobel_edges(rgba, width, height), width, height);
        let by_edges = flood_background(width, height, |x, y| !edges[y * width + x]);
        if plausible(&by_edges) {
            (by_edges, MaskSource::Edges)
        } else {
            (ellipse(width, height), MaskSource::Ellipse)
        }
    };

    Ok(Mask {
        width,
        height,
        foreground: majority_filter(&foreground, width, height),
        source,
    })
}

pub fn apply_alpha(rgba: &mut [u8], mask: &Mask) {
    for (px, &fg) in rgba.chunks_exact_mut(4).zip(&mask.foreground) {
        px[3] = if fg { 255 } else { 0 };
    }
}

fn ratio(mask: &[bool]) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    mask.iter().filter(|&&fg| fg).count() as f64 / mask.len() as f64
}

fn pixel(rgba: &[u8], width: usize, x: usize, y: usize) -> [u8; 3] {
    let i = (y * width + x) * 4;
    [rgba[i], rgba[i + 1], rgba[i + 2]]
}

fn border_coords(width: usize, height: usize) -> impl Iterator<Item = (usize, usize)> {
    let top_bottom = (0..width).flat_map(move |x| [(x, 0), (x, height - 1)]);
    let sides = (0..height).flat_map(move |y| [(0, y), (width - 1, y)]);
    top_bottom.chain(sides)
}

/// Per-channel median of the frame border.
fn border_color(rgba: &[u8], width: usize, height: usize) -> [u8; 3] {
    let mut channels: [Vec<u8>; 3] = Default::default();
    for (x, y) in border_coords(width, height) {
        let p = pixel(rgba, width, x, y);
        for c in 0..3 {
            channels[c].push(p[c]);
        }
    }
    let mut out = [0u8; 3];
    for c in 0..3 {
        channels[c].sort_unstable();
        out[c] = channels[c][channels[c].len() / 2];
    }
    out
}

fn close_to(p: [u8; 3], q: [u8; 3]) -> bool {
    let d: f64 = (0..3)
        .map(|c| {
            let diff = p[c] as f64 - q[c] as f64;
            diff * diff
        })
        .sum();
    d.sqrt() <= COLOR_TOLERANCE
}

/// Returns the foreground mask: every pixel the border cannot reach through
/// `passable` pixels.
fn flood_background(width: usize, height: usize, passable: impl Fn(usize, usize) -> bool) -> Vec<bool> {
    let mut is_background = vec![false; width * height];
    let mut queue = VecDeque::new();
    for (x, y) in border_coords(width, height) {
        let i = y * width + x;
        if !is_background[i] && passable(x, y) {
            is_background[i] = true;
            queue.push_back((x, y));
        }
    }
    while let Some((x, y)) = queue.pop_front() {
        let mut visit = |nx: usize, ny: usize| {
            let i = ny * width + nx;
            if !is_background[i] && passable(nx, ny) {
                is_background[i] = true;
                queue.push_back((nx, ny));
            }
        };
        if x > 0 {
            visit(x - 1, y);
        }
        if x + 1 < width {
            visit(x + 1, y);
        }
        if y > 0 {
            visit(x, y - 1);
        }
        if y + 1 < height {
            visit(x, y + 1);
        }
    }
    is_background.into_iter().map(|bg| !bg).collect()
}

fn plausible(foreground: &[bool]) -> bool {
    (MIN_FOREGROUND..=MAX_FOREGROUND).contains(&ratio(foreground))
}

fn luma(rgba: &[u8], width: usize, x: usize, y: usize) -> f64 {
    let [r, g, b] = pixel(rgba, width, x, y);
    0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64
}

/// Sobel gradient magnitude on luma, thresholded. Neighbours past the frame
/// are clamped to the edge pixel.
fn sobel_edges(rgba: &[u8], width: usize, height: usize) -> Vec<bool> {
    let at = |x: isize, y: isize| {
        let cx = x.clamp(0, width as isize - 1) as usize;
        let cy = y.clamp(0, height as isize - 1) as usize;
        luma(rgba, width, cx, cy)
    };
    let mut edges = Vec::with_capacity(width * height);
    for y in 0..height as isize {
        for x in 0..width as isize {
            let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
            edges.push((gx * gx + gy * gy).sqrt() >= EDGE_THRESHOLD);
        }
    }
    edges
}

/// 3x3 dilation; closes one-pixel gaps in an outline.
fn dilate(mask: &[bool], width: usize, height: usize) -> Vec<bool> {
    let mut out = Vec::with_capacity(mask.len());
    for y in 0..height {
        for x in 0..width {
            let hit = (y.saturating_sub(1)..=(y + 1).min(height - 1))
                .any(|ny| (x.saturating_sub(1)..=(x + 1).min(width - 1)).any(|nx| mask[ny * width + nx]));
            out.push(hit);
        }
    }
    out
}

fn ellipse(width: usize, height: usize) -> Vec<bool> {
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    let rx = (width as f64 * ELLIPSE_SPAN / 2.0).max(0.5);
    let ry = (height as f64 * ELLIPSE_SPAN / 2.0).max(0.5);
    let mut mask = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let dx = (x as f64 + 0.5 - cx) / rx;
            let dy = (y as f64 + 0.5 - cy) / ry;
            mask.push(dx * dx + dy * dy <= 1.0);
        }
    }
    mask
}

fn majority_filter(mask: &[bool], width: usize, height: usize) -> Vec<bool> {
    let mut out = Vec::with_capacity(mask.len());
    for y in 0..height {
        for x in 0..width {
            let (mut fg, mut total) = (0usize, 0usize);
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    total += 1;
                    if mask[ny * width + nx] {
                        fg += 1;
                    }
                }
            }
            out.push(fg * 2 > total);
        }
    }
    out
}
