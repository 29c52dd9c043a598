//! Screen-space placement of the lip region
//!
//! The poster is a plane in its anchor's local frame: width along local +X,
//! height along local +Z (video top at -Z), normal along local +Y. Lip
//! coordinates address that plane in normalized video space; their four
//! corners are projected through view * projection and bounded in pixels.

use crate::model::LipCoordinates;
use crate::tracking::{CameraProjection, Pose, PosterSize, Viewport};
use nalgebra::{Matrix4, Vector4};
use serde::Serialize;

/// Clip-space w below this counts as behind the camera
const MIN_CLIP_W: f32 = 1e-4;

/// Axis-aligned lip rectangle in screen pixels (origin top-left)
///
/// May extend past the viewport; consumers clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScreenRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub viewport: Viewport,
}

/// Rectangle in normalized screen units (`[0,1]` spans the viewport)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalizedRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ScreenRect {
    pub fn normalized(&self) -> NormalizedRect {
        let vw = self.viewport.width.max(1) as f32;
        let vh = self.viewport.height.max(1) as f32;
        NormalizedRect {
            x: self.x / vw,
            y: self.y / vh,
            width: self.width / vw,
            height: self.height / vh,
        }
    }

    /// Intersection with the viewport as `(x0, y0, x1, y1)` pixel bounds,
    /// end-exclusive; None if empty
    pub fn clipped_bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let vw = self.viewport.width as f32;
        let vh = self.viewport.height as f32;
        let x0 = self.x.floor().clamp(0.0, vw);
        let y0 = self.y.floor().clamp(0.0, vh);
        let x1 = (self.x + self.width).ceil().clamp(0.0, vw);
        let y1 = (self.y + self.height).ceil().clamp(0.0, vh);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }
}

/// Result of projecting the lip region for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LipProjection {
    Visible(ScreenRect),
    /// Behind the camera, degenerate, or entirely off screen
    NotVisible,
}

impl LipProjection {
    pub fn rect(&self) -> Option<&ScreenRect> {
        match self {
            LipProjection::Visible(rect) => Some(rect),
            LipProjection::NotVisible => None,
        }
    }
}

/// Per-frame pose → screen transform with cached camera matrices
#[derive(Debug)]
pub struct RenderCoordinator {
    camera: Option<CameraProjection>,
    view_projection: Matrix4<f32>,
    recomputations: u64,
}

impl Default for RenderCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderCoordinator {
    pub fn new() -> Self {
        Self {
            camera: None,
            view_projection: Matrix4::identity(),
            recomputations: 0,
        }
    }

    /// Forget the cached camera (next frame recomputes)
    pub fn invalidate(&mut self) {
        self.camera = None;
    }

    /// Times the view-projection product was rebuilt
    pub fn matrix_recomputations(&self) -> u64 {
        self.recomputations
    }

    fn view_projection(&mut self, camera: &CameraProjection) -> Matrix4<f32> {
        if self.camera.as_ref() != Some(camera) {
            self.view_projection = camera.projection * camera.view;
            self.camera = Some(*camera);
            self.recomputations += 1;
        }
        self.view_projection
    }

    /// Project the lip region of a poster at `pose` onto the screen
    pub fn compute_transform(
        &mut self,
        pose: &Pose,
        camera: &CameraProjection,
        poster: PosterSize,
        lip: &LipCoordinates,
    ) -> LipProjection {
        let viewport = camera.viewport;
        if viewport.width == 0 || viewport.height == 0 {
            return LipProjection::NotVisible;
        }

        let mvp = self.view_projection(camera) * pose.model_matrix();
        let vw = viewport.width as f32;
        let vh = viewport.height as f32;

        let corners = [
            (lip.x(), lip.y()),
            (lip.x() + lip.width(), lip.y()),
            (lip.x(), lip.y() + lip.height()),
            (lip.x() + lip.width(), lip.y() + lip.height()),
        ];

        let mut min_x = f32::INFINITY;
        let mut min_y = f32::INFINITY;
        let mut max_x = f32::NEG_INFINITY;
        let mut max_y = f32::NEG_INFINITY;

        for (u, v) in corners {
            let local = Vector4::new(
                (u - 0.5) * poster.width_m,
                0.0,
                (v - 0.5) * poster.height_m,
                1.0,
            );
            let clip = mvp * local;
            if clip.w <= MIN_CLIP_W {
                return LipProjection::NotVisible;
            }
            let ndc_x = clip.x / clip.w;
            let ndc_y = clip.y / clip.w;
            let px = (ndc_x + 1.0) * 0.5 * vw;
            let py = (1.0 - ndc_y) * 0.5 * vh;

            min_x = min_x.min(px);
            max_x = max_x.max(px);
            min_y = min_y.min(py);
            max_y = max_y.max(py);
        }

        let finite = [min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite());
        if !finite || max_x - min_x < f32::EPSILON || max_y - min_y < f32::EPSILON {
            return LipProjection::NotVisible;
        }
        if max_x <= 0.0 || max_y <= 0.0 || min_x >= vw || min_y >= vh {
            return LipProjection::NotVisible;
        }

        LipProjection::Visible(ScreenRect {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
            viewport,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{camera, pose_at};

    fn poster() -> PosterSize {
        PosterSize {
            width_m: 0.4,
            height_m: 0.3,
        }
    }

    fn lip() -> LipCoordinates {
        LipCoordinates::new(0.4, 0.5, 0.2, 0.15).unwrap()
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.5
    }

    #[test]
    fn test_centered_poster_projection() {
        let mut coordinator = RenderCoordinator::new();
        let projection =
            coordinator.compute_transform(&pose_at(0.0, 0.0, -1.0), &camera(), poster(), &lip());

        let rect = *projection.rect().expect("visible");
        // f = 1/tan(30°); x = ±0.04 m, y in [-0.045, 0] m at 1 m distance
        assert!(approx(rect.x, 303.4), "x = {}", rect.x);
        assert!(approx(rect.x + rect.width, 336.6), "x1 = {}", rect.x + rect.width);
        assert!(approx(rect.y, 240.0), "y = {}", rect.y);
        assert!(approx(rect.y + rect.height, 258.7), "y1 = {}", rect.y + rect.height);

        let normalized = rect.normalized();
        assert!((normalized.x - rect.x / 640.0).abs() < 1e-6);
        assert!((normalized.height - rect.height / 480.0).abs() < 1e-6);
    }

    #[test]
    fn test_farther_poster_is_smaller() {
        let mut coordinator = RenderCoordinator::new();
        let near = coordinator.compute_transform(&pose_at(0.0, 0.0, -1.0), &camera(), poster(), &lip());
        let far = coordinator.compute_transform(&pose_at(0.0, 0.0, -2.0), &camera(), poster(), &lip());
        let (near, far) = (near.rect().unwrap(), far.rect().unwrap());
        assert!((far.width - near.width / 2.0).abs() < 0.5);
    }

    #[test]
    fn test_behind_camera_not_visible() {
        let mut coordinator = RenderCoordinator::new();
        let projection =
            coordinator.compute_transform(&pose_at(0.0, 0.0, 1.0), &camera(), poster(), &lip());
        assert_eq!(projection, LipProjection::NotVisible);
    }

    #[test]
    fn test_off_screen_not_visible() {
        let mut coordinator = RenderCoordinator::new();
        let projection =
            coordinator.compute_transform(&pose_at(5.0, 0.0, -1.0), &camera(), poster(), &lip());
        assert_eq!(projection, LipProjection::NotVisible);
    }

    #[test]
    fn test_partially_visible_rect_not_clipped() {
        let mut coordinator = RenderCoordinator::new();
        // Lip region straddles the left edge
        let x = -(0.577 * 4.0 / 3.0);
        let projection =
            coordinator.compute_transform(&pose_at(x, 0.0, -1.0), &camera(), poster(), &lip());
        let rect = projection.rect().expect("partially visible");
        assert!(rect.x < 0.0);
        assert!(rect.x + rect.width > 0.0);

        let (x0, _, x1, _) = rect.clipped_bounds().unwrap();
        assert_eq!(x0, 0);
        assert!(x1 > 0);
    }

    #[test]
    fn test_matrices_recomputed_only_on_camera_change() {
        let mut coordinator = RenderCoordinator::new();
        let cam = camera();
        for i in 0..60 {
            let pose = pose_at(0.0, 0.001 * i as f32, -1.0);
            coordinator.compute_transform(&pose, &cam, poster(), &lip());
        }
        assert_eq!(coordinator.matrix_recomputations(), 1);

        let mut moved = cam;
        moved.view = Matrix4::new_translation(&nalgebra::Vector3::new(0.0, 0.0, -0.1));
        coordinator.compute_transform(&pose_at(0.0, 0.0, -1.0), &moved, poster(), &lip());
        assert_eq!(coordinator.matrix_recomputations(), 2);
    }

    #[test]
    fn test_edge_on_poster_not_visible() {
        let mut coordinator = RenderCoordinator::new();
        // Identity orientation: poster plane contains the view direction
        let pose = Pose::new(nalgebra::Vector3::new(0.0, 0.0, -1.0), nalgebra::UnitQuaternion::identity());
        let projection = coordinator.compute_transform(&pose, &camera(), poster(), &lip());
        // Lip corners collapse onto a line in y; x extent survives but height is ~0
        assert_eq!(projection, LipProjection::NotVisible);
    }
}
