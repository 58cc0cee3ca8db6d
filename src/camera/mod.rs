//! Camera state and the optimizable parameter set.
//!
//! A camera is described by nine scalar parameters in a fixed canonical
//! order: translation XYZ, rotation XYZ (degrees), focal length and the two
//! film offsets. [`CameraParameterSet`] is the working copy the optimizer
//! mutates; it is synchronized with the external scene only at explicit
//! points ([`CameraParameterSet::refresh_from_scene`] /
//! [`CameraParameterSet::apply_to_scene`]).

use nalgebra::{DVector, Isometry3, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry;
use crate::scene::{Scene, SceneError};

/// Camera pose: translation and intrinsic XYZ Euler rotation in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraExtrinsics {
    pub translation: Vector3<f64>,
    pub rotation: Vector3<f64>,
}

/// Film-back intrinsics, all in millimetres.
///
/// The apertures describe the physical film back and are never optimized;
/// focal length and the offsets are regular parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub focal_length: f64,
    pub film_offset_x: f64,
    pub film_offset_y: f64,
    pub film_aperture_h: f64,
    pub film_aperture_v: f64,
}

impl CameraIntrinsics {
    /// Reject physically impossible film backs.
    pub fn validate(&self) -> Result<(), CameraParamError> {
        if self.focal_length <= 0.0 {
            return Err(CameraParamError::InvalidIntrinsics(format!(
                "focal length must be positive, got {}",
                self.focal_length
            )));
        }
        if self.film_aperture_h <= 0.0 || self.film_aperture_v <= 0.0 {
            return Err(CameraParamError::InvalidIntrinsics(format!(
                "film apertures must be positive, got {}x{}",
                self.film_aperture_h, self.film_aperture_v
            )));
        }
        Ok(())
    }
}

/// Image resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Errors from parameter-set operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraParamError {
    #[error("unknown camera parameter '{0}'")]
    UnknownParameter(String),
    #[error("expected {expected} parameter values, got {actual}")]
    ParameterCountMismatch { expected: usize, actual: usize },
    #[error("invalid constraint for {param}: min {min} exceeds max {max}")]
    InvalidConstraint { param: ParamId, min: f64, max: f64 },
    #[error("invalid camera intrinsics: {0}")]
    InvalidIntrinsics(String),
    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// The nine optimizable camera parameters, in canonical order.
///
/// The discriminant doubles as the parameter's index into the full value
/// vector, so the enum order must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ParamId {
    TranslateX = 0,
    TranslateY = 1,
    TranslateZ = 2,
    RotateX = 3,
    RotateY = 4,
    RotateZ = 5,
    FocalLength = 6,
    FilmOffsetX = 7,
    FilmOffsetY = 8,
}

/// Number of optimizable parameters.
pub const PARAM_COUNT: usize = 9;

impl ParamId {
    /// All parameters in canonical order.
    pub const ALL: [ParamId; PARAM_COUNT] = [
        ParamId::TranslateX,
        ParamId::TranslateY,
        ParamId::TranslateZ,
        ParamId::RotateX,
        ParamId::RotateY,
        ParamId::RotateZ,
        ParamId::FocalLength,
        ParamId::FilmOffsetX,
        ParamId::FilmOffsetY,
    ];

    /// Index into the canonical parameter vector.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable external name, used in snapshots and log output.
    pub fn name(self) -> &'static str {
        match self {
            ParamId::TranslateX => "translate_x",
            ParamId::TranslateY => "translate_y",
            ParamId::TranslateZ => "translate_z",
            ParamId::RotateX => "rotate_x",
            ParamId::RotateY => "rotate_y",
            ParamId::RotateZ => "rotate_z",
            ParamId::FocalLength => "focal_length",
            ParamId::FilmOffsetX => "film_offset_x",
            ParamId::FilmOffsetY => "film_offset_y",
        }
    }

    pub fn from_name(name: &str) -> Result<ParamId, CameraParamError> {
        ParamId::ALL
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| CameraParamError::UnknownParameter(name.to_string()))
    }
}

impl std::fmt::Display for ParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock flag and optional bounds for one parameter.
///
/// A locked parameter keeps its current value through an optimization run.
/// Bounds clamp the value immediately on assignment and constrain the solver
/// search space for unlocked parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ParameterConstraint {
    pub is_locked: bool,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl ParameterConstraint {
    pub fn locked() -> Self {
        Self {
            is_locked: true,
            ..Self::default()
        }
    }

    pub fn bounded(min: f64, max: f64) -> Self {
        Self {
            is_locked: false,
            min_value: Some(min),
            max_value: Some(max),
        }
    }

    /// Clamp a value into the constraint's bounds.
    pub fn clamp(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(min) = self.min_value {
            v = v.max(min);
        }
        if let Some(max) = self.max_value {
            v = v.min(max);
        }
        v
    }
}

/// Working copy of a camera's optimizable state, tied to a named camera in
/// the external scene.
#[derive(Debug, Clone)]
pub struct CameraParameterSet {
    camera_id: String,
    extrinsics: CameraExtrinsics,
    intrinsics: CameraIntrinsics,
    constraints: [ParameterConstraint; PARAM_COUNT],
}

/// Focal length stays physically plausible by default.
const DEFAULT_FOCAL_BOUNDS: (f64, f64) = (1.0, 1000.0);
/// Film offsets beyond this put the principal point far off the film back.
const DEFAULT_OFFSET_BOUNDS: (f64, f64) = (-50.0, 50.0);

fn default_constraints() -> [ParameterConstraint; PARAM_COUNT] {
    let mut constraints = [ParameterConstraint::default(); PARAM_COUNT];
    constraints[ParamId::FocalLength.index()] =
        ParameterConstraint::bounded(DEFAULT_FOCAL_BOUNDS.0, DEFAULT_FOCAL_BOUNDS.1);
    constraints[ParamId::FilmOffsetX.index()] =
        ParameterConstraint::bounded(DEFAULT_OFFSET_BOUNDS.0, DEFAULT_OFFSET_BOUNDS.1);
    constraints[ParamId::FilmOffsetY.index()] =
        ParameterConstraint::bounded(DEFAULT_OFFSET_BOUNDS.0, DEFAULT_OFFSET_BOUNDS.1);
    constraints
}

impl CameraParameterSet {
    pub fn new(
        camera_id: &str,
        extrinsics: CameraExtrinsics,
        intrinsics: CameraIntrinsics,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            extrinsics,
            intrinsics,
            constraints: default_constraints(),
        }
    }

    /// Build a parameter set from the camera's current scene state.
    pub fn from_scene<S: Scene>(scene: &S, camera_id: &str) -> Result<Self, CameraParamError> {
        let extrinsics = scene.read_camera_extrinsics(camera_id)?;
        let intrinsics = scene.read_camera_intrinsics(camera_id)?;
        intrinsics.validate()?;
        Ok(Self::new(camera_id, extrinsics, intrinsics))
    }

    /// Re-read values from the scene, keeping locks and bounds as they are.
    /// Re-read values are clamped into their bounds like any assignment.
    pub fn refresh_from_scene<S: Scene>(&mut self, scene: &S) -> Result<(), SceneError> {
        let extrinsics = scene.read_camera_extrinsics(&self.camera_id)?;
        let intrinsics = scene.read_camera_intrinsics(&self.camera_id)?;
        self.extrinsics = extrinsics;
        self.intrinsics.film_aperture_h = intrinsics.film_aperture_h;
        self.intrinsics.film_aperture_v = intrinsics.film_aperture_v;
        for param in ParamId::ALL {
            let raw = match param {
                ParamId::FocalLength => intrinsics.focal_length,
                ParamId::FilmOffsetX => intrinsics.film_offset_x,
                ParamId::FilmOffsetY => intrinsics.film_offset_y,
                _ => self.value(param),
            };
            self.set_value(param, raw);
        }
        Ok(())
    }

    /// Write the current values back to the external camera.
    pub fn apply_to_scene<S: Scene>(&self, scene: &mut S) -> Result<(), SceneError> {
        scene.write_camera_extrinsics(&self.camera_id, &self.extrinsics)?;
        scene.write_camera_intrinsics(
            &self.camera_id,
            self.intrinsics.focal_length,
            self.intrinsics.film_offset_x,
            self.intrinsics.film_offset_y,
        )
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn extrinsics(&self) -> &CameraExtrinsics {
        &self.extrinsics
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn value(&self, param: ParamId) -> f64 {
        match param {
            ParamId::TranslateX => self.extrinsics.translation.x,
            ParamId::TranslateY => self.extrinsics.translation.y,
            ParamId::TranslateZ => self.extrinsics.translation.z,
            ParamId::RotateX => self.extrinsics.rotation.x,
            ParamId::RotateY => self.extrinsics.rotation.y,
            ParamId::RotateZ => self.extrinsics.rotation.z,
            ParamId::FocalLength => self.intrinsics.focal_length,
            ParamId::FilmOffsetX => self.intrinsics.film_offset_x,
            ParamId::FilmOffsetY => self.intrinsics.film_offset_y,
        }
    }

    /// Assign a value, clamping it into the parameter's bounds.
    pub fn set_value(&mut self, param: ParamId, value: f64) {
        let clamped = self.constraints[param.index()].clamp(value);
        match param {
            ParamId::TranslateX => self.extrinsics.translation.x = clamped,
            ParamId::TranslateY => self.extrinsics.translation.y = clamped,
            ParamId::TranslateZ => self.extrinsics.translation.z = clamped,
            ParamId::RotateX => self.extrinsics.rotation.x = clamped,
            ParamId::RotateY => self.extrinsics.rotation.y = clamped,
            ParamId::RotateZ => self.extrinsics.rotation.z = clamped,
            ParamId::FocalLength => self.intrinsics.focal_length = clamped,
            ParamId::FilmOffsetX => self.intrinsics.film_offset_x = clamped,
            ParamId::FilmOffsetY => self.intrinsics.film_offset_y = clamped,
        }
    }

    pub fn is_locked(&self, param: ParamId) -> bool {
        self.constraints[param.index()].is_locked
    }

    pub fn lock(&mut self, param: ParamId, locked: bool) {
        self.constraints[param.index()].is_locked = locked;
    }

    pub fn constraint(&self, param: ParamId) -> &ParameterConstraint {
        &self.constraints[param.index()]
    }

    /// Replace a parameter's constraint. The current value is re-clamped
    /// into the new bounds immediately.
    pub fn set_constraint(
        &mut self,
        param: ParamId,
        constraint: ParameterConstraint,
    ) -> Result<(), CameraParamError> {
        if let (Some(min), Some(max)) = (constraint.min_value, constraint.max_value) {
            if min > max {
                return Err(CameraParamError::InvalidConstraint { param, min, max });
            }
        }
        self.constraints[param.index()] = constraint;
        self.set_value(param, self.value(param));
        Ok(())
    }

    /// Parameters currently free to move, in canonical order.
    pub fn unlocked(&self) -> Vec<ParamId> {
        ParamId::ALL
            .into_iter()
            .filter(|p| !self.is_locked(*p))
            .collect()
    }

    /// Values of the unlocked parameters as a solver vector, in canonical
    /// order.
    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.unlocked().len(),
            self.unlocked().into_iter().map(|p| self.value(p)),
        )
    }

    /// Assign unlocked parameters from a solver vector. The vector length
    /// must match the current number of unlocked parameters.
    pub fn from_vector(&mut self, values: &[f64]) -> Result<(), CameraParamError> {
        let unlocked = self.unlocked();
        if values.len() != unlocked.len() {
            return Err(CameraParamError::ParameterCountMismatch {
                expected: unlocked.len(),
                actual: values.len(),
            });
        }
        for (param, value) in unlocked.into_iter().zip(values) {
            self.set_value(param, *value);
        }
        Ok(())
    }

    /// Lower and upper bounds aligned with [`CameraParameterSet::to_vector`].
    /// Unbounded sides are reported as infinity.
    pub fn bounds_for_vector(&self) -> (Vec<f64>, Vec<f64>) {
        let unlocked = self.unlocked();
        let lower = unlocked
            .iter()
            .map(|p| {
                self.constraints[p.index()]
                    .min_value
                    .unwrap_or(f64::NEG_INFINITY)
            })
            .collect();
        let upper = unlocked
            .iter()
            .map(|p| {
                self.constraints[p.index()]
                    .max_value
                    .unwrap_or(f64::INFINITY)
            })
            .collect();
        (lower, upper)
    }

    /// All nine parameter values in canonical order, locked ones included.
    pub fn full_values(&self) -> [f64; PARAM_COUNT] {
        let mut values = [0.0; PARAM_COUNT];
        for param in ParamId::ALL {
            values[param.index()] = self.value(param);
        }
        values
    }

    /// The camera's rigid world transform from the current extrinsics.
    pub fn world_transform(&self) -> Isometry3<f64> {
        geometry::world_transform(&self.extrinsics)
    }

    /// Serializable snapshot of the full parameter state.
    pub fn snapshot(&self) -> CameraSnapshot {
        CameraSnapshot {
            camera: self.camera_id.clone(),
            film_aperture_h: self.intrinsics.film_aperture_h,
            film_aperture_v: self.intrinsics.film_aperture_v,
            parameters: ParamId::ALL
                .into_iter()
                .map(|p| {
                    let c = self.constraints[p.index()];
                    ParameterState {
                        name: p.name().to_string(),
                        value: self.value(p),
                        is_locked: c.is_locked,
                        min_value: c.min_value,
                        max_value: c.max_value,
                    }
                })
                .collect(),
        }
    }

    /// Restore values, locks and bounds from a snapshot. Unknown parameter
    /// names and inverted bounds are rejected.
    pub fn apply_snapshot(&mut self, snapshot: &CameraSnapshot) -> Result<(), CameraParamError> {
        for state in &snapshot.parameters {
            let param = ParamId::from_name(&state.name)?;
            self.set_constraint(
                param,
                ParameterConstraint {
                    is_locked: state.is_locked,
                    min_value: state.min_value,
                    max_value: state.max_value,
                },
            )?;
            self.set_value(param, state.value);
        }
        self.intrinsics.film_aperture_h = snapshot.film_aperture_h;
        self.intrinsics.film_aperture_v = snapshot.film_aperture_v;
        Ok(())
    }
}

/// Serializable state of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub value: f64,
    pub is_locked: bool,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

/// Serializable snapshot of a camera's full parameter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSnapshot {
    pub camera: String,
    pub film_aperture_h: f64,
    pub film_aperture_v: f64,
    pub parameters: Vec<ParameterState>,
}
