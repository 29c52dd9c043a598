//! Lip-region compositing onto the camera frame
//!
//! Only pixels inside the screen rectangle are touched. Inside it, the lip
//! sub-rectangle of the video frame is stretched over the rectangle and
//! blended with an opacity that ramps from 0 at the edge to 1 at
//! `feather_radius` inside it. The radius is in normalized screen units, so
//! the seam looks the same at every resolution.

use crate::error::{Error, Result};
use crate::model::LipCoordinates;
use crate::render::coordinator::ScreenRect;
use image::RgbaImage;
use std::sync::Arc;

/// Decoded video frame (straight-alpha RGBA)
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Arc<RgbaImage>,
    /// Presentation time within the video
    pub position_ms: u64,
}

impl VideoFrame {
    pub fn new(image: RgbaImage, position_ms: u64) -> Self {
        Self {
            image: Arc::new(image),
            position_ms,
        }
    }
}

/// Blends the mouth region of a talking video onto the live camera image
#[derive(Debug, Clone, Copy)]
pub struct LipRegionCompositor {
    lip: LipCoordinates,
}

impl LipRegionCompositor {
    pub fn new(lip: LipCoordinates) -> Self {
        Self { lip }
    }

    pub fn lip(&self) -> &LipCoordinates {
        &self.lip
    }

    /// Blend `frame`'s lip region into `camera` over `rect`
    ///
    /// Returns the number of camera pixels modified.
    pub fn render(
        &self,
        camera: &mut RgbaImage,
        frame: &VideoFrame,
        rect: &ScreenRect,
        feather_radius: f32,
    ) -> Result<usize> {
        if camera.width() != rect.viewport.width || camera.height() != rect.viewport.height {
            return Err(Error::InvalidState(format!(
                "camera frame {}x{} does not match viewport {}x{}",
                camera.width(),
                camera.height(),
                rect.viewport.width,
                rect.viewport.height
            )));
        }
        if !feather_radius.is_finite() || feather_radius < 0.0 {
            return Err(Error::Config(format!(
                "feather radius must be a non-negative normalized value, got {}",
                feather_radius
            )));
        }

        let video = frame.image.as_ref();
        if video.width() == 0 || video.height() == 0 || rect.width <= 0.0 || rect.height <= 0.0 {
            return Ok(0);
        }
        let Some((x0, y0, x1, y1)) = rect.clipped_bounds() else {
            return Ok(0);
        };

        let vw = rect.viewport.width as f32;
        let vh = rect.viewport.height as f32;
        let norm = rect.normalized();
        let fw = video.width() as f32;
        let fh = video.height() as f32;

        let mut written = 0;
        for py in y0..y1 {
            let cy = py as f32 + 0.5;
            let ty = (cy - rect.y) / rect.height;
            if !(0.0..=1.0).contains(&ty) {
                continue;
            }
            // Distance to the nearest horizontal edge, normalized
            let ny = cy / vh;
            let edge_y = (ny - norm.y).min(norm.y + norm.height - ny);
            let sy = sample_index(self.lip.y() + ty * self.lip.height(), fh);

            for px in x0..x1 {
                let cx = px as f32 + 0.5;
                let tx = (cx - rect.x) / rect.width;
                if !(0.0..=1.0).contains(&tx) {
                    continue;
                }
                let nx = cx / vw;
                let edge_x = (nx - norm.x).min(norm.x + norm.width - nx);
                let coverage = feather(edge_x.min(edge_y), feather_radius);
                if coverage <= 0.0 {
                    continue;
                }

                let sx = sample_index(self.lip.x() + tx * self.lip.width(), fw);
                let src = video.get_pixel(sx, sy).0;
                let dst = camera.get_pixel_mut(px, py);
                dst.0 = blend(dst.0, src, coverage);
                written += 1;
            }
        }

        Ok(written)
    }
}

/// Nearest texel for normalized coordinate `t` along an axis of `size` texels
fn sample_index(t: f32, size: f32) -> u32 {
    ((t * size - 0.5).round().max(0.0) as u32).min(size as u32 - 1)
}

/// Smoothstep opacity ramp over `radius` from the edge
fn feather(distance: f32, radius: f32) -> f32 {
    if distance < 0.0 {
        return 0.0;
    }
    if radius <= 0.0 {
        return 1.0;
    }
    let t = (distance / radius).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Straight-alpha source-over with an extra coverage factor; destination
/// alpha is preserved
fn blend(dst: [u8; 4], src: [u8; 4], coverage: f32) -> [u8; 4] {
    let op = ((coverage * 255.0).round() as i32).clamp(0, 255) as u16;
    let sa = mul_div255(u16::from(src[3]), op);
    let inv = 255u16 - u16::from(sa);

    let mut out = dst;
    for i in 0..3 {
        let sc = mul_div255(u16::from(src[i]), u16::from(sa));
        let dc = mul_div255(u16::from(dst[i]), inv);
        out[i] = sc.saturating_add(dc);
    }
    out
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::Viewport;
    use image::Rgba;

    const GRAY: Rgba<u8> = Rgba([100, 100, 100, 255]);
    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    fn rect(x: f32, y: f32, w: f32, h: f32, vw: u32, vh: u32) -> ScreenRect {
        ScreenRect {
            x,
            y,
            width: w,
            height: h,
            viewport: Viewport {
                width: vw,
                height: vh,
            },
        }
    }

    /// 100x100 video: red inside the lip region (0.4,0.5,0.2,0.15), blue elsewhere
    fn video() -> VideoFrame {
        let img = RgbaImage::from_fn(100, 100, |x, y| {
            if (40..60).contains(&x) && (50..65).contains(&y) {
                RED
            } else {
                BLUE
            }
        });
        VideoFrame::new(img, 0)
    }

    fn compositor() -> LipRegionCompositor {
        LipRegionCompositor::new(LipCoordinates::new(0.4, 0.5, 0.2, 0.15).unwrap())
    }

    #[test]
    fn test_pixels_outside_rect_untouched() {
        let mut camera = RgbaImage::from_pixel(200, 100, GRAY);
        let target = rect(50.0, 20.0, 40.0, 30.0, 200, 100);
        let written = compositor()
            .render(&mut camera, &video(), &target, 0.0)
            .unwrap();
        assert_eq!(written, 40 * 30);

        for (x, y, pixel) in camera.enumerate_pixels() {
            let inside = (50..90).contains(&x) && (20..50).contains(&y);
            if !inside {
                assert_eq!(*pixel, GRAY, "pixel ({}, {}) modified", x, y);
            }
        }
    }

    #[test]
    fn test_only_lip_region_of_video_sampled() {
        let mut camera = RgbaImage::from_pixel(200, 100, GRAY);
        let target = rect(50.0, 20.0, 40.0, 30.0, 200, 100);
        compositor()
            .render(&mut camera, &video(), &target, 0.0)
            .unwrap();

        for y in 20..50 {
            for x in 50..90 {
                assert_eq!(*camera.get_pixel(x, y), RED, "pixel ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_feather_ramps_opacity_toward_edge() {
        let mut camera = RgbaImage::from_pixel(200, 200, GRAY);
        let target = rect(50.0, 50.0, 100.0, 100.0, 200, 200);
        // 0.1 normalized = 20 px
        compositor()
            .render(&mut camera, &video(), &target, 0.1)
            .unwrap();

        let center = camera.get_pixel(100, 100);
        assert_eq!(*center, RED);

        let edge = camera.get_pixel(50, 100)[0];
        let mid = camera.get_pixel(60, 100)[0];
        let inner = camera.get_pixel(72, 100)[0];
        assert!(edge < mid && mid < inner, "{} {} {}", edge, mid, inner);
        assert!(edge < 110);
        assert_eq!(inner, 255);
    }

    #[test]
    fn test_feather_is_resolution_independent() {
        let lip = compositor();
        let red_at = |scale: u32| {
            let size = 100 * scale;
            let mut camera = RgbaImage::from_pixel(size, size, GRAY);
            let target = rect(
                25.0 * scale as f32,
                25.0 * scale as f32,
                50.0 * scale as f32,
                50.0 * scale as f32,
                size,
                size,
            );
            lip.render(&mut camera, &video(), &target, 0.1).unwrap();
            // Pixel just left of 5% of the viewport inside the rect edge
            let x = 30 * scale - 1;
            let y = 50 * scale;
            camera.get_pixel(x, y)[0] as i32
        };

        let low = red_at(1);
        let high = red_at(4);
        assert!((low - high).abs() <= 24, "low {} high {}", low, high);
    }

    #[test]
    fn test_partially_offscreen_rect_clipped() {
        let mut camera = RgbaImage::from_pixel(100, 100, GRAY);
        let target = rect(-20.0, -10.0, 50.0, 40.0, 100, 100);
        let written = compositor()
            .render(&mut camera, &video(), &target, 0.0)
            .unwrap();
        assert_eq!(written, 30 * 30);
        assert_eq!(*camera.get_pixel(31, 5), GRAY);
    }

    #[test]
    fn test_transparent_video_leaves_camera() {
        let mut camera = RgbaImage::from_pixel(50, 50, GRAY);
        let clear = VideoFrame::new(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 0])), 0);
        compositor()
            .render(&mut camera, &clear, &rect(10.0, 10.0, 20.0, 20.0, 50, 50), 0.0)
            .unwrap();
        assert!(camera.pixels().all(|p| *p == GRAY));
    }

    #[test]
    fn test_viewport_mismatch_rejected() {
        let mut camera = RgbaImage::from_pixel(64, 48, GRAY);
        let result = compositor().render(
            &mut camera,
            &video(),
            &rect(0.0, 0.0, 10.0, 10.0, 640, 480),
            0.0,
        );
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_negative_feather_rejected() {
        let mut camera = RgbaImage::from_pixel(64, 48, GRAY);
        let result = compositor().render(
            &mut camera,
            &video(),
            &rect(0.0, 0.0, 10.0, 10.0, 64, 48),
            -0.1,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
