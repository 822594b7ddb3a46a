//! Raster frame wrapper on top of the pure Rust `image`/`imageproc` stack.

use std::path::Path;

use image::{imageops, DynamicImage, GrayImage, ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use nalgebra::Matrix3;

use crate::engine::RegistrationError;
use crate::geometry::{Point2d, Rect};
use crate::types::FrameRotation;

pub type Result<T> = std::result::Result<T, RegistrationError>;

/// Annotation colours, RGB.
pub mod colors {
    use image::Rgb;

    pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
    pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
    pub const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
    pub const CYAN: Rgb<u8> = Rgb([0, 255, 255]);
    pub const ORANGE: Rgb<u8> = Rgb([255, 128, 0]);
    pub const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
}

/// One camera frame held as 8-bit RGB.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn filled(width: u32, height: u32, color: Rgb<u8>) -> Self {
        Self::new(ImageBuffer::from_pixel(width, height, color))
    }

    pub fn from_rgb8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let img = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, data).ok_or_else(|| {
            RegistrationError::ImageError(format!("buffer does not hold a {width}x{height} RGB image"))
        })?;
        Ok(Self::new(img))
    }

    /// Builds a frame from interleaved BGR bytes, the usual capture layout.
    pub fn from_bgr8(width: u32, height: u32, mut data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(3));
        if expected != Some(data.len()) {
            return Err(RegistrationError::ImageError(format!(
                "{} bytes do not hold a {width}x{height} BGR image",
                data.len()
            )));
        }
        for px in data.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        Self::from_rgb8(width, height, data)
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self::new(image.to_rgb8())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }

    pub fn as_rgb_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_rgb(self) -> RgbImage {
        self.image
    }

    pub fn to_gray(&self) -> GrayImage {
        imageops::grayscale(&self.image)
    }

    pub fn rotate(&self, rotation: FrameRotation) -> Frame {
        match rotation {
            FrameRotation::None => self.clone(),
            FrameRotation::Cw90 => Frame::new(imageops::rotate90(&self.image)),
            FrameRotation::Ccw90 => Frame::new(imageops::rotate270(&self.image)),
            FrameRotation::Rotate180 => Frame::new(imageops::rotate180(&self.image)),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.image.save(path)?;
        Ok(())
    }
}

pub fn imread<P: AsRef<Path>>(path: P) -> Result<Frame> {
    let img = image::open(path)?;
    Ok(Frame::from_dynamic(img))
}

/// Warps `src` by `matrix` (source to destination pixels) into a
/// `width` x `height` image. Pixels mapping outside the source stay black.
pub fn warp_perspective(src: &Frame, matrix: &Matrix3<f64>, width: u32, height: u32) -> Result<Frame> {
    let mut out_img = RgbImage::new(width, height);
    let src_img = src.as_rgb();

    // Reverse mapping: every output pixel samples the source.
    let m_inv = matrix
        .try_inverse()
        .ok_or_else(|| RegistrationError::ImageError("Matrix is not invertible".to_string()))?;

    let (m00, m01, m02) = (m_inv[(0, 0)], m_inv[(0, 1)], m_inv[(0, 2)]);
    let (m10, m11, m12) = (m_inv[(1, 0)], m_inv[(1, 1)], m_inv[(1, 2)]);
    let (m20, m21, m22) = (m_inv[(2, 0)], m_inv[(2, 1)], m_inv[(2, 2)]);
    let src_cols = src.width() as i64;
    let src_rows = src.height() as i64;

    for y in 0..height {
        let y_f = y as f64;
        let m01y = m01 * y_f;
        let m11y = m11 * y_f;
        let m21y = m21 * y_f;

        for x in 0..width {
            let x_f = x as f64;
            let w = m20 * x_f + m21y + m22;
            if w.abs() < 1e-12 {
                continue;
            }
            let src_x_f = (m00 * x_f + m01y + m02) / w;
            let src_y_f = (m10 * x_f + m11y + m12) / w;
            if !src_x_f.is_finite() || !src_y_f.is_finite() {
                continue;
            }

            let x0 = src_x_f.floor() as i64;
            let y0 = src_y_f.floor() as i64;
            let x1 = x0 + 1;
            let y1 = y0 + 1;

            if x0 >= 0 && x1 < src_cols && y0 >= 0 && y1 < src_rows {
                let fx = src_x_f - x0 as f64;
                let fy = src_y_f - y0 as f64;

                let p00 = src_img.get_pixel(x0 as u32, y0 as u32);
                let p10 = src_img.get_pixel(x1 as u32, y0 as u32);
                let p01 = src_img.get_pixel(x0 as u32, y1 as u32);
                let p11 = src_img.get_pixel(x1 as u32, y1 as u32);

                let mut rgb = [0u8; 3];
                for (c, out) in rgb.iter_mut().enumerate() {
                    let v = (1.0 - fx) * (1.0 - fy) * p00[c] as f64
                        + fx * (1.0 - fy) * p10[c] as f64
                        + (1.0 - fx) * fy * p01[c] as f64
                        + fx * fy * p11[c] as f64;
                    *out = v.round().clamp(0.0, 255.0) as u8;
                }
                out_img.put_pixel(x, y, Rgb(rgb));
            } else if x0 >= 0 && x0 < src_cols && y0 >= 0 && y0 < src_rows {
                // Last row/column: nearest neighbour.
                out_img.put_pixel(x, y, *src_img.get_pixel(x0 as u32, y0 as u32));
            }
        }
    }

    Ok(Frame::new(out_img))
}

/// Outlines `rect` with corners at `(x, y)` and `(x + w, y + h)`, both inclusive.
pub fn draw_rect(frame: &mut Frame, rect: &Rect, color: Rgb<u8>, thickness: u32) {
    let (x, y, w, h) = rect.to_ints();
    if w < 0 || h < 0 {
        return;
    }
    for grow in 0..thickness.max(1) as i32 {
        let outline = imageproc::rect::Rect::at(x - grow, y - grow)
            .of_size((w + 1 + 2 * grow) as u32, (h + 1 + 2 * grow) as u32);
        draw_hollow_rect_mut(frame.as_rgb_mut(), outline, color);
    }
}

/// Closed polyline through `pts`.
pub fn draw_polygon(frame: &mut Frame, pts: &[Point2d], color: Rgb<u8>, thickness: u32) {
    if pts.len() < 2 {
        return;
    }
    let t = thickness.max(1) as i32;
    for (i, a) in pts.iter().enumerate() {
        let b = &pts[(i + 1) % pts.len()];
        for off in 0..t {
            let d = off as f32;
            draw_line_segment_mut(
                frame.as_rgb_mut(),
                (a.x as f32 + d, a.y as f32),
                (b.x as f32 + d, b.y as f32),
                color,
            );
            draw_line_segment_mut(
                frame.as_rgb_mut(),
                (a.x as f32, a.y as f32 + d),
                (b.x as f32, b.y as f32 + d),
                color,
            );
        }
    }
}
