//! A correspondence ties one externally-owned 3D anchor to one observed 2D
//! pixel position.
//!
//! World positions are read live from the scene on every access. A
//! correspondence whose anchor has vanished is latched invalid on the first
//! failed read and stays invalid for the rest of its life, even if an anchor
//! with the same id later reappears; stale pairs never silently rejoin a
//! solve.

use std::cell::Cell;

use nalgebra::{Point3, Vector2};

use crate::camera::{CameraParameterSet, Resolution};
use crate::geometry::{self, ProjectionError};
use crate::scene::{AnchorId, Scene, SceneError};

/// Errors raised while evaluating a correspondence.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CorrespondenceError {
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// One 3D-anchor-to-2D-pixel observation.
#[derive(Debug, Clone)]
pub struct Correspondence {
    id: u64,
    anchor: AnchorId,
    pixel: Vector2<f64>,
    anchor_hint: Option<Point3<f64>>,
    valid: Cell<bool>,
}

impl Correspondence {
    pub fn new(id: u64, anchor: AnchorId, pixel_x: f64, pixel_y: f64) -> Self {
        Self {
            id,
            anchor,
            pixel: Vector2::new(pixel_x, pixel_y),
            anchor_hint: None,
            valid: Cell::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn anchor(&self) -> AnchorId {
        self.anchor
    }

    /// The observed pixel position in image coordinates.
    pub fn pixel(&self) -> Vector2<f64> {
        self.pixel
    }

    pub fn set_pixel_observation(&mut self, pixel_x: f64, pixel_y: f64) {
        self.pixel = Vector2::new(pixel_x, pixel_y);
    }

    /// Last world position recorded for the anchor, if any. Used when
    /// restoring sessions whose anchors are gone from the scene.
    pub fn world_anchor_hint(&self) -> Option<Point3<f64>> {
        self.anchor_hint
    }

    pub fn set_world_anchor_hint(&mut self, position: Point3<f64>) {
        self.anchor_hint = Some(position);
    }

    /// Whether the pair can currently contribute to a solve: not latched
    /// invalid, and its anchor still resolves in the scene.
    ///
    /// This is a live query and does not latch on its own.
    pub fn is_valid<S: Scene>(&self, scene: &S) -> bool {
        self.valid.get() && scene.read_world_position(self.anchor).is_ok()
    }

    /// Whether the pair has been latched invalid by a failed position read.
    pub fn is_latched_invalid(&self) -> bool {
        !self.valid.get()
    }

    /// Read the anchor's current world position, latching the pair invalid
    /// on failure.
    pub fn world_position<S: Scene>(&self, scene: &S) -> Result<Point3<f64>, SceneError> {
        if !self.valid.get() {
            return Err(SceneError::AnchorMissing(self.anchor));
        }
        match scene.read_world_position(self.anchor) {
            Ok(position) => Ok(position),
            Err(err) => {
                self.valid.set(false);
                Err(err)
            }
        }
    }

    /// Project the anchor through the camera to pixel coordinates.
    pub fn projected_pixel<S: Scene>(
        &self,
        scene: &S,
        params: &CameraParameterSet,
        resolution: Resolution,
    ) -> Result<Vector2<f64>, CorrespondenceError> {
        let world = self.world_position(scene)?;
        let pixel = geometry::project_to_pixel(
            &world,
            &params.world_transform(),
            params.intrinsics(),
            resolution,
        )?;
        Ok(pixel)
    }

    /// Euclidean pixel distance between the observation and the anchor's
    /// reprojection. Infinite when the pair cannot be evaluated.
    pub fn reprojection_error<S: Scene>(
        &self,
        scene: &S,
        params: &CameraParameterSet,
        resolution: Resolution,
    ) -> f64 {
        match self.projected_pixel(scene, params, resolution) {
            Ok(projected) => (projected - self.pixel).norm(),
            Err(_) => f64::INFINITY,
        }
    }
}
