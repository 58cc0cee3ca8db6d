//! High-level session facade.
//!
//! [`CameraMatcher`] owns the correspondence list and the camera parameter
//! working copy, and drives optimization runs against a caller-supplied
//! [`Scene`]. It also serializes whole sessions (image size, camera state,
//! pairs) to a snapshot so a matching setup can be saved and restored.

use std::collections::BTreeMap;
use std::sync::mpsc::SyncSender;

use log::{info, warn};
use nalgebra::{Point3, Vector2};
use serde::{Deserialize, Serialize};

use crate::camera::{CameraParamError, CameraParameterSet, CameraSnapshot, Resolution};
use crate::correspondence::Correspondence;
use crate::optimization::{
    self, CameraOptimizer, OptimizationResult, OptimizeError, OptimizeMethod, ProgressEvent,
};
use crate::scene::{AnchorId, Scene};

/// Serializable state of one correspondence pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSnapshot {
    pub id: u64,
    pub anchor: AnchorId,
    pub pixel_x: f64,
    pub pixel_y: f64,
    /// World position at export time, kept so a session remains inspectable
    /// even when its anchors are gone from the scene.
    pub world_position: Option<[f64; 3]>,
}

/// Serializable state of a whole matching session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub image_width: u32,
    pub image_height: u32,
    pub camera: Option<CameraSnapshot>,
    pub pairs: Vec<PairSnapshot>,
}

/// Manages correspondences and camera parameters for one matching session.
#[derive(Debug)]
pub struct CameraMatcher {
    pairs: Vec<Correspondence>,
    params: Option<CameraParameterSet>,
    resolution: Resolution,
    next_pair_id: u64,
    /// Solver backend for [`CameraMatcher::optimize`] when no override is
    /// given.
    pub method: OptimizeMethod,
    pub max_evaluations: usize,
    pub tolerance: f64,
    progress: Option<SyncSender<ProgressEvent>>,
}

impl Default for CameraMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraMatcher {
    pub fn new() -> Self {
        Self {
            pairs: Vec::new(),
            params: None,
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            next_pair_id: 1,
            method: OptimizeMethod::default(),
            max_evaluations: 1000,
            tolerance: 1e-6,
            progress: None,
        }
    }

    /// Set the pixel dimensions of the matched image.
    pub fn set_image(&mut self, width: u32, height: u32) {
        self.resolution = Resolution { width, height };
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Bind the session to a camera in the scene, reading its current state.
    pub fn set_camera<S: Scene>(
        &mut self,
        scene: &S,
        camera_id: &str,
    ) -> Result<(), CameraParamError> {
        self.params = Some(CameraParameterSet::from_scene(scene, camera_id)?);
        Ok(())
    }

    pub fn camera_params(&self) -> Option<&CameraParameterSet> {
        self.params.as_ref()
    }

    pub fn camera_params_mut(&mut self) -> Option<&mut CameraParameterSet> {
        self.params.as_mut()
    }

    /// Add a correspondence for an anchor, returning the new pair's id.
    pub fn add_pair(&mut self, anchor: AnchorId, pixel_x: f64, pixel_y: f64) -> u64 {
        let id = self.next_pair_id;
        self.next_pair_id += 1;
        self.pairs
            .push(Correspondence::new(id, anchor, pixel_x, pixel_y));
        id
    }

    /// Insert a fully-formed pair, keeping the id counter ahead of it.
    pub fn insert_pair(&mut self, pair: Correspondence) {
        self.next_pair_id = self.next_pair_id.max(pair.id() + 1);
        self.pairs.push(pair);
    }

    /// Remove a pair by id. Returns `false` when the id is unknown.
    pub fn remove_pair(&mut self, id: u64) -> bool {
        let before = self.pairs.len();
        self.pairs.retain(|p| p.id() != id);
        self.pairs.len() != before
    }

    pub fn pair(&self, id: u64) -> Option<&Correspondence> {
        self.pairs.iter().find(|p| p.id() == id)
    }

    pub fn pair_mut(&mut self, id: u64) -> Option<&mut Correspondence> {
        self.pairs.iter_mut().find(|p| p.id() == id)
    }

    pub fn pairs(&self) -> &[Correspondence] {
        &self.pairs
    }

    /// Update the observed pixel position of a pair. Returns `false` when
    /// the id is unknown.
    pub fn update_pixel_observation(&mut self, id: u64, pixel_x: f64, pixel_y: f64) -> bool {
        match self.pair_mut(id) {
            Some(pair) => {
                pair.set_pixel_observation(pixel_x, pixel_y);
                true
            }
            None => false,
        }
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn valid_pair_count<S: Scene>(&self, scene: &S) -> usize {
        self.pairs.iter().filter(|p| p.is_valid(scene)).count()
    }

    pub fn clear_pairs(&mut self) {
        self.pairs.clear();
    }

    /// Attach a channel that receives one event per residual evaluation of
    /// subsequent optimization runs.
    pub fn set_progress_sender(&mut self, sender: SyncSender<ProgressEvent>) {
        self.progress = Some(sender);
    }

    /// Run the optimizer and, on success, write the refined camera state
    /// back to the scene.
    pub fn optimize<S: Scene>(
        &mut self,
        scene: &mut S,
        method: Option<OptimizeMethod>,
    ) -> Result<OptimizationResult, OptimizeError> {
        let Self { params, pairs, .. } = self;
        let params = params.as_mut().ok_or_else(|| {
            OptimizeError::SetupInvalid("no camera bound to the session".to_string())
        })?;

        let mut optimizer = CameraOptimizer::new(&*scene, params, pairs, self.resolution);
        optimizer.method = method.unwrap_or(self.method);
        optimizer.max_evaluations = self.max_evaluations;
        optimizer.tolerance = self.tolerance;
        if let Some(sender) = &self.progress {
            optimizer.set_progress_sender(sender.clone());
        }

        let result = optimizer.optimize(None)?;
        if result.converged {
            params.apply_to_scene(scene)?;
        }
        Ok(result)
    }

    /// Root-mean-square pixel error over the valid pairs for the current
    /// camera state. Infinite without a bound camera or valid pairs.
    pub fn rms_error<S: Scene>(&self, scene: &S) -> f64 {
        match &self.params {
            Some(params) => {
                optimization::rms_error(scene, params, &self.pairs, self.resolution)
            }
            None => f64::INFINITY,
        }
    }

    /// Pixel error per currently valid pair id; invalid pairs are omitted.
    /// Empty without a bound camera.
    pub fn per_pair_errors<S: Scene>(&self, scene: &S) -> Vec<(u64, f64)> {
        match &self.params {
            Some(params) => optimization::per_correspondence_errors(
                scene,
                params,
                &self.pairs,
                self.resolution,
            ),
            None => Vec::new(),
        }
    }

    /// Project every evaluable pair's anchor to pixel coordinates, keyed by
    /// pair id. Pairs that cannot be projected are omitted.
    pub fn project_all_to_pixels<S: Scene>(&self, scene: &S) -> BTreeMap<u64, Vector2<f64>> {
        let mut projected = BTreeMap::new();
        let Some(params) = &self.params else {
            return projected;
        };
        for pair in &self.pairs {
            if let Ok(pixel) = pair.projected_pixel(scene, params, self.resolution) {
                projected.insert(pair.id(), pixel);
            }
        }
        projected
    }

    /// Capture the full session state for serialization.
    pub fn export_session<S: Scene>(&self, scene: &S) -> SessionSnapshot {
        SessionSnapshot {
            image_width: self.resolution.width,
            image_height: self.resolution.height,
            camera: self.params.as_ref().map(|p| p.snapshot()),
            pairs: self
                .pairs
                .iter()
                .map(|pair| {
                    let world = pair
                        .world_position(scene)
                        .ok()
                        .or(pair.world_anchor_hint());
                    PairSnapshot {
                        id: pair.id(),
                        anchor: pair.anchor(),
                        pixel_x: pair.pixel().x,
                        pixel_y: pair.pixel().y,
                        world_position: world.map(|p| [p.x, p.y, p.z]),
                    }
                })
                .collect(),
        }
    }

    /// Restore a session from a snapshot, replacing the current state.
    ///
    /// A camera missing from the scene is logged and left unbound rather
    /// than failing the whole import; pairs are restored either way.
    pub fn import_session<S: Scene>(
        &mut self,
        scene: &S,
        snapshot: &SessionSnapshot,
    ) -> Result<(), CameraParamError> {
        self.resolution = Resolution {
            width: snapshot.image_width,
            height: snapshot.image_height,
        };

        self.params = None;
        if let Some(camera) = &snapshot.camera {
            match CameraParameterSet::from_scene(scene, &camera.camera) {
                Ok(mut params) => {
                    params.apply_snapshot(camera)?;
                    self.params = Some(params);
                }
                Err(err) => {
                    warn!("session camera not restored: {err}");
                }
            }
        }

        self.pairs.clear();
        self.next_pair_id = 1;
        for pair in &snapshot.pairs {
            let mut restored =
                Correspondence::new(pair.id, pair.anchor, pair.pixel_x, pair.pixel_y);
            if let Some([x, y, z]) = pair.world_position {
                restored.set_world_anchor_hint(Point3::new(x, y, z));
            }
            self.insert_pair(restored);
        }

        info!(
            "session restored: {} pairs, camera {}",
            self.pairs.len(),
            self.params
                .as_ref()
                .map(|p| p.camera_id())
                .unwrap_or("<unbound>"),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraExtrinsics, CameraIntrinsics, ParamId};
    use crate::geometry;
    use crate::scene::MemoryScene;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn standard_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            focal_length: 35.0,
            film_offset_x: 0.0,
            film_offset_y: 0.0,
            film_aperture_h: 36.0,
            film_aperture_v: 24.0,
        }
    }

    fn scene_with_anchors() -> (MemoryScene, Vec<(u64, Point3<f64>)>) {
        let mut scene = MemoryScene::new();
        let anchors = vec![
            (1, Point3::new(0.0, 0.0, -10.0)),
            (2, Point3::new(2.0, 1.0, -12.0)),
            (3, Point3::new(-1.5, 0.8, -9.0)),
            (4, Point3::new(1.0, -1.0, -15.0)),
        ];
        for (id, position) in &anchors {
            scene.insert_anchor(*id, *position);
        }
        (scene, anchors)
    }

    #[test]
    fn test_pair_management() {
        let mut matcher = CameraMatcher::new();
        let a = matcher.add_pair(10, 100.0, 200.0);
        let b = matcher.add_pair(11, 300.0, 400.0);
        assert_ne!(a, b);
        assert_eq!(matcher.pair_count(), 2);

        assert!(matcher.update_pixel_observation(a, 150.0, 250.0));
        assert_eq!(matcher.pair(a).unwrap().pixel(), Vector2::new(150.0, 250.0));
        assert!(!matcher.update_pixel_observation(999, 0.0, 0.0));

        assert!(matcher.remove_pair(a));
        assert!(!matcher.remove_pair(a));
        assert_eq!(matcher.pair_count(), 1);

        // Ids are never reused after removal.
        let c = matcher.add_pair(12, 0.0, 0.0);
        assert!(c > b);

        matcher.clear_pairs();
        assert_eq!(matcher.pair_count(), 0);
    }

    #[test]
    fn test_optimize_requires_camera() {
        let (mut scene, _) = scene_with_anchors();
        let mut matcher = CameraMatcher::new();
        matcher.set_image(1920, 1080);
        matcher.add_pair(1, 0.0, 0.0);
        matcher.add_pair(2, 0.0, 0.0);
        matcher.add_pair(3, 0.0, 0.0);

        assert!(matches!(
            matcher.optimize(&mut scene, None),
            Err(OptimizeError::SetupInvalid(msg)) if msg.contains("no camera")
        ));
    }

    #[test]
    fn test_end_to_end_translation_match_writes_back() {
        let (mut scene, anchors) = scene_with_anchors();
        let truth = CameraParameterSet::new(
            "shotCam",
            CameraExtrinsics {
                translation: Vector3::zeros(),
                rotation: Vector3::zeros(),
            },
            standard_intrinsics(),
        );
        let resolution = Resolution {
            width: 1920,
            height: 1080,
        };

        scene.insert_camera(
            "shotCam",
            CameraExtrinsics {
                translation: Vector3::new(0.8, -0.3, 0.5),
                rotation: Vector3::zeros(),
            },
            standard_intrinsics(),
        );

        let mut matcher = CameraMatcher::new();
        matcher.set_image(1920, 1080);
        matcher.set_camera(&scene, "shotCam").unwrap();
        for (id, world) in &anchors {
            let pixel = geometry::project_to_pixel(
                world,
                &truth.world_transform(),
                truth.intrinsics(),
                resolution,
            )
            .unwrap();
            matcher.add_pair(*id, pixel.x, pixel.y);
        }
        {
            let params = matcher.camera_params_mut().unwrap();
            for param in [
                ParamId::RotateX,
                ParamId::RotateY,
                ParamId::RotateZ,
                ParamId::FocalLength,
                ParamId::FilmOffsetX,
                ParamId::FilmOffsetY,
            ] {
                params.lock(param, true);
            }
        }

        assert_eq!(matcher.valid_pair_count(&scene), 4);
        let result = matcher.optimize(&mut scene, None).unwrap();
        assert!(result.converged);
        assert!(matcher.rms_error(&scene) < 0.5);
        for (_, error) in matcher.per_pair_errors(&scene) {
            assert!(error < 1.0);
        }

        // The refined pose was written back to the scene camera.
        let extr = scene.read_camera_extrinsics("shotCam").unwrap();
        assert_relative_eq!(extr.translation, Vector3::zeros(), epsilon = 1e-3);
    }

    #[test]
    fn test_unconverged_run_is_not_written_back() {
        let (mut scene, anchors) = scene_with_anchors();
        let truth = CameraParameterSet::new(
            "shotCam",
            CameraExtrinsics {
                translation: Vector3::zeros(),
                rotation: Vector3::zeros(),
            },
            standard_intrinsics(),
        );
        let start = CameraExtrinsics {
            translation: Vector3::new(4.0, -3.0, 2.0),
            rotation: Vector3::new(10.0, -15.0, 5.0),
        };
        scene.insert_camera("shotCam", start.clone(), standard_intrinsics());

        let mut matcher = CameraMatcher::new();
        matcher.set_image(1920, 1080);
        matcher.set_camera(&scene, "shotCam").unwrap();
        for (id, world) in &anchors {
            let pixel = geometry::project_to_pixel(
                world,
                &truth.world_transform(),
                truth.intrinsics(),
                matcher.resolution(),
            )
            .unwrap();
            matcher.add_pair(*id, pixel.x, pixel.y);
        }
        {
            let params = matcher.camera_params_mut().unwrap();
            for param in [ParamId::FocalLength, ParamId::FilmOffsetX, ParamId::FilmOffsetY] {
                params.lock(param, true);
            }
        }

        // One iteration cannot reach the optimum from this start.
        matcher.max_evaluations = 1;
        let result = matcher.optimize(&mut scene, None).unwrap();
        assert!(!result.converged);

        // The scene camera keeps its pre-run pose; only the working copy
        // holds the partial progress.
        let extr = scene.read_camera_extrinsics("shotCam").unwrap();
        assert_eq!(extr.translation, start.translation);
        assert_eq!(extr.rotation, start.rotation);
    }

    #[test]
    fn test_project_all_skips_unprojectable_pairs() {
        let (mut scene, _) = scene_with_anchors();
        scene.insert_camera(
            "shotCam",
            CameraExtrinsics {
                translation: Vector3::zeros(),
                rotation: Vector3::zeros(),
            },
            standard_intrinsics(),
        );
        // Anchor on the camera plane cannot be projected.
        scene.insert_anchor(50, Point3::new(0.0, 0.0, 0.0));

        let mut matcher = CameraMatcher::new();
        matcher.set_image(1920, 1080);
        matcher.set_camera(&scene, "shotCam").unwrap();
        let a = matcher.add_pair(1, 0.0, 0.0);
        let bad = matcher.add_pair(50, 0.0, 0.0);

        let projected = matcher.project_all_to_pixels(&scene);
        assert!(projected.contains_key(&a));
        assert!(!projected.contains_key(&bad));
        assert_relative_eq!(projected[&a], Vector2::new(960.0, 540.0), epsilon = 1e-9);
    }

    #[test]
    fn test_session_round_trip() {
        let (scene, _) = scene_with_anchors();
        let mut scene = scene;
        scene.insert_camera(
            "shotCam",
            CameraExtrinsics {
                translation: Vector3::new(1.0, 2.0, 3.0),
                rotation: Vector3::new(5.0, -10.0, 15.0),
            },
            standard_intrinsics(),
        );

        let mut matcher = CameraMatcher::new();
        matcher.set_image(1920, 1080);
        matcher.set_camera(&scene, "shotCam").unwrap();
        matcher
            .camera_params_mut()
            .unwrap()
            .lock(ParamId::FocalLength, true);
        matcher.add_pair(1, 100.0, 200.0);
        matcher.add_pair(2, 300.0, 400.0);

        let snapshot = matcher.export_session(&scene);
        let json = serde_json::to_string_pretty(&snapshot).unwrap();
        let restored: SessionSnapshot = serde_json::from_str(&json).unwrap();

        let mut other = CameraMatcher::new();
        other.import_session(&scene, &restored).unwrap();

        assert_eq!(other.resolution().width, 1920);
        assert_eq!(other.pair_count(), 2);
        assert_eq!(other.pair(1).unwrap().pixel(), Vector2::new(100.0, 200.0));
        let params = other.camera_params().unwrap();
        assert!(params.is_locked(ParamId::FocalLength));
        assert_eq!(params.extrinsics().translation, Vector3::new(1.0, 2.0, 3.0));

        // New pairs do not collide with restored ids.
        let next = other.add_pair(3, 0.0, 0.0);
        assert_eq!(next, 3);
    }

    #[test]
    fn test_import_with_missing_camera_keeps_pairs() {
        let (scene, _) = scene_with_anchors();
        let snapshot = SessionSnapshot {
            image_width: 1280,
            image_height: 720,
            camera: Some(CameraSnapshot {
                camera: "goneCam".to_string(),
                film_aperture_h: 36.0,
                film_aperture_v: 24.0,
                parameters: Vec::new(),
            }),
            pairs: vec![PairSnapshot {
                id: 7,
                anchor: 1,
                pixel_x: 10.0,
                pixel_y: 20.0,
                world_position: Some([0.0, 0.0, -10.0]),
            }],
        };

        let mut matcher = CameraMatcher::new();
        matcher.import_session(&scene, &snapshot).unwrap();
        assert!(matcher.camera_params().is_none());
        assert_eq!(matcher.pair_count(), 1);
        assert_eq!(
            matcher.pair(7).unwrap().world_anchor_hint(),
            Some(Point3::new(0.0, 0.0, -10.0))
        );
    }
}
