use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::{Frame, LandmarkFrame, LandmarkPoint, NUM_LANDMARKS};

pub const INPUT_SIZE: u32 = 224;
pub const PALM_INPUT_SIZE: u32 = 192;

/// How a frame was scaled and padded into the square model input.
#[derive(Clone, Debug, PartialEq)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub new_w: u32,
    pub new_h: u32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl LetterboxInfo {
    pub fn for_frame(width: u32, height: u32, target_size: u32) -> Self {
        let scale = target_size as f32 / (width.max(height).max(1) as f32);
        let new_w = ((width as f32 * scale).round().max(1.0) as u32).min(target_size);
        let new_h = ((height as f32 * scale).round().max(1.0) as u32).min(target_size);
        Self {
            scale,
            new_w,
            new_h,
            pad_x: (target_size - new_w) / 2,
            pad_y: (target_size - new_h) / 2,
            orig_w: width,
            orig_h: height,
        }
    }

    /// Maps a model-input pixel back into unclamped frame pixels.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// A square, rotated window of the frame fed to the handpose estimator.
#[derive(Clone, Debug, PartialEq)]
pub struct CropTransform {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
    pub output_size: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl CropTransform {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        let half = self.output_size as f32 / 2.0;
        let scale = self.side / self.output_size as f32;
        let dx = (x - half) * scale;
        let dy = (y - half) * scale;
        let (sin, cos) = self.angle.sin_cos();
        (
            self.center.0 + dx * cos - dy * sin,
            self.center.1 + dx * sin + dy * cos,
        )
    }

    /// Maps a crop-space coordinate back into a frame pixel.
    pub fn project(&self, x: f32, y: f32) -> LandmarkPoint {
        let (fx, fy) = self.to_frame(x, y);
        LandmarkPoint::from_projected(fx, fy, self.orig_w, self.orig_h)
    }
}

fn check_buffer(frame: &Frame) -> Result<()> {
    let expected_len = (frame.width as usize)
        .saturating_mul(frame.height as usize)
        .saturating_mul(4);
    if frame.rgba.len() != expected_len || expected_len == 0 {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgba.len(),
            expected_len
        ));
    }
    Ok(())
}

/// Resizes the frame into a padded `target_size` square and converts it to a
/// `(1, H, W, 3)` tensor of `[0, 1]` floats.
pub fn prepare_frame(frame: &Frame, target_size: u32) -> Result<(Array4<f32>, LetterboxInfo)> {
    check_buffer(frame)?;
    let letterbox = LetterboxInfo::for_frame(frame.width, frame.height, target_size);

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image =
        fir::images::Image::new(letterbox.new_w, letterbox.new_h, fir::PixelType::U8x4);
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    fir::Resizer::new()
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let side = target_size as usize;
    let mut canvas = vec![0u8; side * side * 4];
    let dst_stride = side * 4;
    let src_stride = letterbox.new_w as usize * 4;
    for row in 0..(letterbox.new_h as usize) {
        let dst_offset = (letterbox.pad_y as usize + row) * dst_stride + letterbox.pad_x as usize * 4;
        let src_offset = row * src_stride;
        canvas[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized[src_offset..src_offset + src_stride]);
    }

    let normalized: Vec<f32> = canvas
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();
    let input = Array4::<f32>::from_shape_vec((1, side, side, 3), normalized)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    Ok((input, letterbox))
}

/// Samples a `side`-pixel square centred on `center` and rotated by `angle`
/// into an `output_size` tensor. Pixels outside the frame read as black.
pub fn prepare_rotated_crop(
    frame: &Frame,
    center: (f32, f32),
    side: f32,
    angle: f32,
    output_size: u32,
) -> Result<(Array4<f32>, CropTransform)> {
    check_buffer(frame)?;
    let transform = CropTransform {
        center,
        side,
        angle,
        output_size,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    let size = output_size as usize;
    let data: Vec<f32> = (0..size * size)
        .into_par_iter()
        .flat_map_iter(|idx| {
            let x = (idx % size) as f32 + 0.5;
            let y = (idx / size) as f32 + 0.5;
            let (sx, sy) = transform.to_frame(x, y);
            sample_rgb(frame, sx, sy)
        })
        .collect();

    let array = Array4::<f32>::from_shape_vec((1, size, size, 3), data)
        .map_err(|err| anyhow!("failed to build rotated crop tensor: {err}"))?;
    Ok((array, transform))
}

fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if !x.is_finite() || !y.is_finite() {
        return [0.0; 3];
    }
    // pixel centres sit at +0.5
    let x = x - 0.5;
    let y = y - 0.5;
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let (w, h) = (frame.width as i64, frame.height as i64);
    let fetch = |cx: f32, cy: f32| -> [f32; 3] {
        let (ix, iy) = (cx as i64, cy as i64);
        if ix < 0 || iy < 0 || ix >= w || iy >= h {
            return [0.0; 3];
        }
        let idx = ((iy * w + ix) as usize) * 4;
        match frame.rgba.get(idx..idx + 3) {
            Some(px) => [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ],
            None => [0.0; 3],
        }
    };

    let c00 = fetch(x0, y0);
    let c10 = fetch(x0 + 1.0, y0);
    let c01 = fetch(x0, y0 + 1.0);
    let c11 = fetch(x0 + 1.0, y0 + 1.0);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    std::array::from_fn(|c| lerp(lerp(c00[c], c10[c], fx), lerp(c01[c], c11[c], fx), fy))
}

/// Turns the flat `x, y, z` model output of a crop into a pixel-space hand.
pub fn decode_hand(flat: &[f32], transform: &CropTransform) -> Result<LandmarkFrame> {
    if flat.len() < NUM_LANDMARKS * 3 {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            NUM_LANDMARKS * 3
        ));
    }

    let points = flat
        .chunks_exact(3)
        .take(NUM_LANDMARKS)
        .map(|xyz| transform.project(xyz[0], xyz[1]))
        .collect();
    Ok(LandmarkFrame::new(points))
}
