//! The `scene` module defines the boundary to the external collaborator that
//! owns the actual 3D content: anchor points and the camera being matched.
//!
//! The core never stores world positions or camera state of its own beyond
//! the [`crate::camera::CameraParameterSet`] working copy; it reads anchors
//! live through the [`Scene`] trait on every access and writes camera state
//! back only at explicit synchronization points.
//!
//! [`MemoryScene`] is a plain in-memory implementation for batch callers and
//! tests. Interactive hosts (a DCC application, a renderer) implement the
//! trait against their own object model instead.

use std::collections::HashMap;

use nalgebra::{Isometry3, Point3};

use crate::camera::{CameraExtrinsics, CameraIntrinsics};
use crate::geometry;

/// Identifier of an externally-owned 3D anchor point.
pub type AnchorId = u64;

/// Errors reported by the external scene collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("anchor {0} does not exist in the scene")]
    AnchorMissing(AnchorId),
    #[error("camera '{0}' does not exist in the scene")]
    CameraMissing(String),
}

/// Read/write access to the externally-owned scene.
///
/// Reads are live: the core calls [`Scene::read_world_position`] on every
/// evaluation rather than caching positions, so interactive edits are picked
/// up immediately and a vanished anchor is detected on the next access.
/// Writes happen only through
/// [`CameraParameterSet::apply_to_scene`](crate::camera::CameraParameterSet::apply_to_scene),
/// never implicitly while an optimization run is in flight.
pub trait Scene {
    /// Current world position of an anchor point.
    fn read_world_position(&self, anchor: AnchorId) -> Result<Point3<f64>, SceneError>;

    /// Translation and XYZ Euler rotation (degrees) of a camera.
    fn read_camera_extrinsics(&self, camera: &str) -> Result<CameraExtrinsics, SceneError>;

    /// Film-back intrinsics of a camera (focal length, offsets, apertures).
    fn read_camera_intrinsics(&self, camera: &str) -> Result<CameraIntrinsics, SceneError>;

    /// The camera's 4x4 world transform.
    ///
    /// The default implementation composes it from the extrinsics; hosts
    /// whose cameras live under transform hierarchies override this.
    fn read_camera_world_transform(&self, camera: &str) -> Result<Isometry3<f64>, SceneError> {
        Ok(geometry::world_transform(
            &self.read_camera_extrinsics(camera)?,
        ))
    }

    /// Write translation and rotation back to the external camera.
    fn write_camera_extrinsics(
        &mut self,
        camera: &str,
        extrinsics: &CameraExtrinsics,
    ) -> Result<(), SceneError>;

    /// Write the optimizable intrinsics back to the external camera.
    ///
    /// Apertures are owned by the external camera and are never written.
    fn write_camera_intrinsics(
        &mut self,
        camera: &str,
        focal_length: f64,
        film_offset_x: f64,
        film_offset_y: f64,
    ) -> Result<(), SceneError>;
}

/// Camera record stored by [`MemoryScene`].
#[derive(Debug, Clone)]
pub struct SceneCamera {
    pub extrinsics: CameraExtrinsics,
    pub intrinsics: CameraIntrinsics,
}

/// In-memory [`Scene`] implementation.
#[derive(Debug, Default)]
pub struct MemoryScene {
    anchors: HashMap<AnchorId, Point3<f64>>,
    cameras: HashMap<String, SceneCamera>,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an anchor point.
    pub fn insert_anchor(&mut self, anchor: AnchorId, position: Point3<f64>) {
        self.anchors.insert(anchor, position);
    }

    /// Move an existing anchor. Returns `false` if the anchor is unknown.
    pub fn move_anchor(&mut self, anchor: AnchorId, position: Point3<f64>) -> bool {
        match self.anchors.get_mut(&anchor) {
            Some(slot) => {
                *slot = position;
                true
            }
            None => false,
        }
    }

    /// Delete an anchor. Returns `false` if the anchor is unknown.
    pub fn remove_anchor(&mut self, anchor: AnchorId) -> bool {
        self.anchors.remove(&anchor).is_some()
    }

    pub fn contains_anchor(&self, anchor: AnchorId) -> bool {
        self.anchors.contains_key(&anchor)
    }

    /// Insert or replace a camera.
    pub fn insert_camera(
        &mut self,
        name: &str,
        extrinsics: CameraExtrinsics,
        intrinsics: CameraIntrinsics,
    ) {
        self.cameras.insert(
            name.to_string(),
            SceneCamera {
                extrinsics,
                intrinsics,
            },
        );
    }

    pub fn camera(&self, name: &str) -> Option<&SceneCamera> {
        self.cameras.get(name)
    }
}

impl Scene for MemoryScene {
    fn read_world_position(&self, anchor: AnchorId) -> Result<Point3<f64>, SceneError> {
        self.anchors
            .get(&anchor)
            .copied()
            .ok_or(SceneError::AnchorMissing(anchor))
    }

    fn read_camera_extrinsics(&self, camera: &str) -> Result<CameraExtrinsics, SceneError> {
        self.cameras
            .get(camera)
            .map(|c| c.extrinsics.clone())
            .ok_or_else(|| SceneError::CameraMissing(camera.to_string()))
    }

    fn read_camera_intrinsics(&self, camera: &str) -> Result<CameraIntrinsics, SceneError> {
        self.cameras
            .get(camera)
            .map(|c| c.intrinsics.clone())
            .ok_or_else(|| SceneError::CameraMissing(camera.to_string()))
    }

    fn write_camera_extrinsics(
        &mut self,
        camera: &str,
        extrinsics: &CameraExtrinsics,
    ) -> Result<(), SceneError> {
        let entry = self
            .cameras
            .get_mut(camera)
            .ok_or_else(|| SceneError::CameraMissing(camera.to_string()))?;
        entry.extrinsics = extrinsics.clone();
        Ok(())
    }

    fn write_camera_intrinsics(
        &mut self,
        camera: &str,
        focal_length: f64,
        film_offset_x: f64,
        film_offset_y: f64,
    ) -> Result<(), SceneError> {
        let entry = self
            .cameras
            .get_mut(camera)
            .ok_or_else(|| SceneError::CameraMissing(camera.to_string()))?;
        entry.intrinsics.focal_length = focal_length;
        entry.intrinsics.film_offset_x = film_offset_x;
        entry.intrinsics.film_offset_y = film_offset_y;
        Ok(())
    }
}
