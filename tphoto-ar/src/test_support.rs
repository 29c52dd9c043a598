//! Shared fixtures for unit tests

use crate::model::{PosterId, ReferencePoster};
use crate::tracking::session::{
    ArFrame, CameraProjection, Detection, Observation, Pose, Viewport,
};
use nalgebra::{Matrix4, UnitQuaternion, Vector3};
use std::io::Cursor;
use std::sync::Arc;

/// Encoded PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 150, 120, 255]));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

/// 40x30 px poster printed 0.4 m wide
pub fn face_poster(id: &str) -> ReferencePoster {
    ReferencePoster {
        id: PosterId::new(id),
        image: Arc::new(png_bytes(40, 30)),
        physical_width_m: 0.4,
        has_human_face: true,
    }
}

pub fn plain_poster(id: &str) -> ReferencePoster {
    ReferencePoster {
        has_human_face: false,
        ..face_poster(id)
    }
}

/// Camera at the origin looking down -Z, 640x480
pub fn camera() -> CameraProjection {
    CameraProjection {
        view: Matrix4::identity(),
        projection: Matrix4::new_perspective(640.0 / 480.0, std::f32::consts::FRAC_PI_3, 0.05, 100.0),
        viewport: Viewport {
            width: 640,
            height: 480,
        },
    }
}

/// Poster centered at (x,y,z) facing the camera (local +Y toward +Z)
pub fn pose_at(x: f32, y: f32, z: f32) -> Pose {
    Pose::new(
        Vector3::new(x, y, z),
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f32::consts::FRAC_PI_2),
    )
}

pub fn frame(timestamp_ms: u64, detections: Vec<Detection>, observations: Vec<Observation>) -> ArFrame {
    ArFrame {
        timestamp_ms,
        camera: camera(),
        detections,
        observations,
    }
}

pub fn tracked(timestamp_ms: u64, id: &str) -> ArFrame {
    frame(
        timestamp_ms,
        vec![],
        vec![Observation {
            poster_id: PosterId::new(id),
            pose: pose_at(0.0, 0.0, -1.0),
            quality: 1.0,
            in_view: true,
        }],
    )
}

pub fn detected(timestamp_ms: u64, id: &str) -> ArFrame {
    frame(
        timestamp_ms,
        vec![Detection {
            poster_id: PosterId::new(id),
            pose: pose_at(0.0, 0.0, -1.0),
        }],
        vec![],
    )
}

/// Flag set when the fetch future it belongs to is dropped
pub struct DropFlag(pub Arc<std::sync::atomic::AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Video source whose fetches never finish
#[derive(Default)]
pub struct PendingSource {
    pub requests: std::sync::Mutex<Vec<crate::model::TalkingPhotoRequest>>,
    pub dropped: std::sync::Mutex<Vec<Arc<std::sync::atomic::AtomicBool>>>,
}

impl PendingSource {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl crate::fetch::VideoSource for PendingSource {
    fn fetch(&self, request: crate::model::TalkingPhotoRequest) -> crate::fetch::FetchTicket {
        use futures::FutureExt;

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        self.dropped.lock().unwrap().push(Arc::clone(&flag));
        let key = request.cache_key();
        self.requests.lock().unwrap().push(request);

        let (_tx, rx) = tokio::sync::watch::channel(crate::fetch::FetchStage::Checking);
        let guard = DropFlag(flag);
        let future = async move {
            let _guard = guard;
            futures::future::pending::<crate::fetch::FetchResult>().await
        };
        crate::fetch::FetchTicket::new(key, rx, future.boxed())
    }
}

/// Frame factory that refuses to open anything
pub struct NoFrames;

impl crate::render::FrameSourceFactory for NoFrames {
    fn open(
        &self,
        path: &std::path::Path,
    ) -> crate::error::Result<Box<dyn crate::render::FrameSource>> {
        Err(crate::error::Error::Decode(format!(
            "no decoder for {}",
            path.display()
        )))
    }
}
