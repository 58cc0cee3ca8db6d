//! Nonlinear refinement of camera parameters from pixel correspondences.
//!
//! [`CameraOptimizer`] assembles a `tiny_solver` problem whose residuals are
//! the stacked per-correspondence pixel errors (x and y per pair) and solves
//! it with Levenberg-Marquardt or Gauss-Newton. Locked parameters are held
//! out of the solver vector entirely; bounds on unlocked parameters are
//! forwarded to the solver.
//!
//! The cost function is generic over [`nalgebra::RealField`] so the solver
//! can differentiate through the full projection with dual numbers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use nalgebra::{DVector, Point3, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{GaussNewtonOptimizer, LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::camera::{CameraParamError, CameraParameterSet, ParamId, Resolution, PARAM_COUNT};
use crate::correspondence::Correspondence;
use crate::geometry;
use crate::scene::{Scene, SceneError};

/// Residual value substituted for both components of a correspondence whose
/// projection degenerates during a solve. Large enough to push the solver
/// away from camera placements that put anchors behind the lens.
pub const PROJECTION_FAILURE_PENALTY: f64 = 1000.0;

/// Stand-in for an infinite bound when the other side of a parameter's range
/// is finite; the solver requires both sides.
const FINITE_BOUND_SENTINEL: f64 = 1e6;

/// Errors from optimizer setup and execution.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("invalid optimization setup: {0}")]
    SetupInvalid(String),
    #[error("optimization failed: {0}")]
    OptimizationFailed(String),
    #[error(transparent)]
    Param(#[from] CameraParamError),
    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// Solver backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizeMethod {
    #[default]
    LevenbergMarquardt,
    GaussNewton,
}

impl OptimizeMethod {
    /// Parse a short method name as used by callers and session files.
    pub fn from_name(name: &str) -> Result<Self, OptimizeError> {
        match name {
            "lm" => Ok(OptimizeMethod::LevenbergMarquardt),
            "gn" => Ok(OptimizeMethod::GaussNewton),
            other => Err(OptimizeError::SetupInvalid(format!(
                "unknown optimization method '{other}'"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OptimizeMethod::LevenbergMarquardt => "lm",
            OptimizeMethod::GaussNewton => "gn",
        }
    }
}

/// Outcome of a completed optimization run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OptimizationResult {
    /// Whether the run stopped because further iterations gain less than the
    /// tolerance, rather than because the iteration budget ran out. A
    /// non-converged run still leaves the parameter set at the best point
    /// explored.
    pub converged: bool,
    /// Final sum of squared pixel residuals.
    pub final_cost: f64,
    /// Number of residual evaluations performed by the solver. This counts
    /// every `residual_func` call, including Jacobian (autodiff) passes, so
    /// it runs several times higher than the solver's accepted step count.
    pub iterations: usize,
}

/// One progress report per residual evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub evaluation: usize,
    /// Sum of squared pixel residuals at this evaluation.
    pub cost: f64,
}

/// Compute the stacked residual vector for a trial solver vector.
///
/// `base` carries all nine canonical parameter values; `slots` maps each
/// canonical parameter to its position in the solver vector, or `None` when
/// the parameter is locked and `base` supplies it.
fn stacked_residuals<T: RealField>(
    observations: &[(Point3<f64>, Vector2<f64>)],
    base: &[f64; PARAM_COUNT],
    slots: &[Option<usize>; PARAM_COUNT],
    film_aperture_h: f64,
    film_aperture_v: f64,
    width: f64,
    height: f64,
    vector: &DVector<T>,
) -> DVector<T> {
    let mut values: Vec<T> = Vec::with_capacity(PARAM_COUNT);
    for i in 0..PARAM_COUNT {
        match slots[i] {
            Some(slot) => values.push(vector[slot].clone()),
            None => values.push(T::from_f64(base[i]).unwrap()),
        }
    }

    let translation = Vector3::new(values[0].clone(), values[1].clone(), values[2].clone());
    let rotation =
        geometry::euler_xyz_rotation(values[3].clone(), values[4].clone(), values[5].clone());
    let rotation_inv = rotation.transpose();
    let focal = values[6].clone();
    let offset_x = values[7].clone();
    let offset_y = values[8].clone();

    let half = T::from_f64(0.5).unwrap();
    let one = T::one();
    let w = T::from_f64(width).unwrap();
    let h = T::from_f64(height).unwrap();
    let ap_h = T::from_f64(film_aperture_h).unwrap();
    let ap_v = T::from_f64(film_aperture_v).unwrap();

    let mut residuals = DVector::zeros(observations.len() * 2);
    for (i, (world, observed)) in observations.iter().enumerate() {
        let world_t = Vector3::new(
            T::from_f64(world.x).unwrap(),
            T::from_f64(world.y).unwrap(),
            T::from_f64(world.z).unwrap(),
        );
        // p_cam = R^T (p_world - t)
        let point_cam = &rotation_inv * (world_t - translation.clone());

        match geometry::camera_to_ndc(
            &point_cam,
            focal.clone(),
            ap_h.clone(),
            ap_v.clone(),
            offset_x.clone(),
            offset_y.clone(),
        ) {
            Ok(ndc) => {
                let pixel_x = (ndc.x.clone() + one.clone()) * half.clone() * w.clone();
                let pixel_y = (one.clone() - ndc.y.clone()) * half.clone() * h.clone();
                residuals[i * 2] = pixel_x - T::from_f64(observed.x).unwrap();
                residuals[i * 2 + 1] = pixel_y - T::from_f64(observed.y).unwrap();
            }
            Err(_) => {
                residuals[i * 2] = T::from_f64(PROJECTION_FAILURE_PENALTY).unwrap();
                residuals[i * 2 + 1] = T::from_f64(PROJECTION_FAILURE_PENALTY).unwrap();
            }
        }
    }
    residuals
}

/// Cost function handed to `tiny_solver`.
///
/// World positions are snapshotted at problem-construction time so the
/// residual vector keeps a fixed length for the whole run.
#[derive(Debug)]
struct ReprojectionCost {
    observations: Vec<(Point3<f64>, Vector2<f64>)>,
    base: [f64; PARAM_COUNT],
    slots: [Option<usize>; PARAM_COUNT],
    film_aperture_h: f64,
    film_aperture_v: f64,
    width: f64,
    height: f64,
    evaluations: Arc<AtomicUsize>,
    progress: Option<Mutex<SyncSender<ProgressEvent>>>,
}

impl<T: RealField> Factor<T> for ReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let residuals = stacked_residuals(
            &self.observations,
            &self.base,
            &self.slots,
            self.film_aperture_h,
            self.film_aperture_v,
            self.width,
            self.height,
            &params[0],
        );

        let evaluation = self.evaluations.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(sender) = &self.progress {
            let cost: f64 = residuals
                .iter()
                .map(|r| {
                    let v: f64 = r.clone().to_subset_unchecked();
                    v * v
                })
                .sum();
            if let Ok(sender) = sender.lock() {
                // Reports are best-effort; a full channel drops the event.
                let _ = sender.try_send(ProgressEvent { evaluation, cost });
            }
        }

        residuals
    }
}

fn run_solver(
    method: OptimizeMethod,
    problem: &tiny_solver::Problem,
    initial_values: &HashMap<String, DVector<f64>>,
    options: OptimizerOptions,
) -> Option<HashMap<String, DVector<f64>>> {
    match method {
        OptimizeMethod::LevenbergMarquardt => {
            LevenbergMarquardtOptimizer::default().optimize(problem, initial_values, Some(options))
        }
        OptimizeMethod::GaussNewton => {
            GaussNewtonOptimizer::default().optimize(problem, initial_values, Some(options))
        }
    }
}

/// Forward bounds to the solver wherever at least one side is finite,
/// substituting the finite sentinel for the open side.
fn apply_bounds(
    problem: &mut tiny_solver::Problem,
    lower: &[f64],
    upper: &[f64],
    unlocked: &[ParamId],
) {
    for (index, (lo, hi)) in lower.iter().zip(upper).enumerate() {
        if lo.is_infinite() && hi.is_infinite() {
            continue;
        }
        let lo = if lo.is_infinite() {
            -FINITE_BOUND_SENTINEL
        } else {
            *lo
        };
        let hi = if hi.is_infinite() {
            FINITE_BOUND_SENTINEL
        } else {
            *hi
        };
        debug!("bounding {} to [{lo}, {hi}]", unlocked[index]);
        problem.set_variable_bounds("camera", index, lo, hi);
    }
}

/// Single-run optimizer binding a parameter set to a scene and a set of
/// correspondences.
pub struct CameraOptimizer<'a, S: Scene> {
    scene: &'a S,
    params: &'a mut CameraParameterSet,
    pairs: &'a [Correspondence],
    resolution: Resolution,
    /// Solver backend used when `optimize` is called without an override.
    pub method: OptimizeMethod,
    /// Upper bound on solver iterations.
    pub max_evaluations: usize,
    /// Minimum absolute and relative cost decrease before the solver stops.
    pub tolerance: f64,
    progress: Option<SyncSender<ProgressEvent>>,
}

impl<'a, S: Scene> CameraOptimizer<'a, S> {
    pub fn new(
        scene: &'a S,
        params: &'a mut CameraParameterSet,
        pairs: &'a [Correspondence],
        resolution: Resolution,
    ) -> Self {
        Self {
            scene,
            params,
            pairs,
            resolution,
            method: OptimizeMethod::default(),
            max_evaluations: 1000,
            tolerance: 1e-6,
            progress: None,
        }
    }

    /// Attach a channel that receives one event per residual evaluation.
    pub fn set_progress_sender(&mut self, sender: SyncSender<ProgressEvent>) {
        self.progress = Some(sender);
    }

    /// Check that the run is well-posed before touching the solver.
    pub fn validate_setup(&self) -> Result<(), OptimizeError> {
        let valid = self
            .pairs
            .iter()
            .filter(|p| p.is_valid(self.scene))
            .count();
        if valid < 3 {
            return Err(OptimizeError::SetupInvalid(format!(
                "at least 3 valid correspondences required, found {valid}"
            )));
        }
        if self.params.unlocked().is_empty() {
            return Err(OptimizeError::SetupInvalid(
                "no unlocked parameters to optimize".to_string(),
            ));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(OptimizeError::SetupInvalid(
                "image resolution must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Snapshot valid correspondences as (world position, observed pixel).
    fn collect_observations(&self) -> Vec<(Point3<f64>, Vector2<f64>)> {
        let mut observations = Vec::with_capacity(self.pairs.len());
        for pair in self.pairs {
            if pair.is_latched_invalid() {
                continue;
            }
            match pair.world_position(self.scene) {
                Ok(world) => observations.push((world, pair.pixel())),
                Err(err) => {
                    warn!("correspondence {} dropped from solve: {err}", pair.id());
                }
            }
        }
        observations
    }

    fn slot_map(&self) -> [Option<usize>; PARAM_COUNT] {
        let mut slots = [None; PARAM_COUNT];
        for (vec_index, param) in self.params.unlocked().into_iter().enumerate() {
            slots[param.index()] = Some(vec_index);
        }
        slots
    }

    /// Current stacked residual vector for the parameter set as-is.
    pub fn residuals(&self) -> DVector<f64> {
        let observations = self.collect_observations();
        stacked_residuals(
            &observations,
            &self.params.full_values(),
            &self.slot_map(),
            self.params.intrinsics().film_aperture_h,
            self.params.intrinsics().film_aperture_v,
            self.resolution.width as f64,
            self.resolution.height as f64,
            &self.params.to_vector(),
        )
    }

    /// Current sum of squared pixel residuals.
    pub fn cost(&self) -> f64 {
        self.residuals().norm_squared()
    }

    /// Write a trial solver vector into the parameter set and return the
    /// resulting residual vector, with live scene reads.
    pub fn evaluate(&mut self, vector: &[f64]) -> Result<DVector<f64>, OptimizeError> {
        self.params.from_vector(vector)?;
        Ok(self.residuals())
    }

    /// Run the solver and write the winning values into the parameter set.
    ///
    /// The scene itself is untouched; callers synchronize with
    /// [`CameraParameterSet::apply_to_scene`] once they accept the result.
    pub fn optimize(
        &mut self,
        method: Option<OptimizeMethod>,
    ) -> Result<OptimizationResult, OptimizeError> {
        self.validate_setup()?;
        let method = method.unwrap_or(self.method);

        let observations = self.collect_observations();
        if observations.len() < 3 {
            return Err(OptimizeError::SetupInvalid(format!(
                "at least 3 valid correspondences required, found {}",
                observations.len()
            )));
        }

        let base = self.params.full_values();
        let slots = self.slot_map();
        let initial = self.params.to_vector();
        let unlocked = self.params.unlocked();
        let intrinsics = self.params.intrinsics().clone();

        info!(
            "optimizing camera '{}' with {} ({} correspondences, {} free parameters)",
            self.params.camera_id(),
            method.name(),
            observations.len(),
            initial.len(),
        );

        let width = self.resolution.width as f64;
        let height = self.resolution.height as f64;

        let evaluations = Arc::new(AtomicUsize::new(0));
        let cost = ReprojectionCost {
            observations: observations.clone(),
            base,
            slots,
            film_aperture_h: intrinsics.film_aperture_h,
            film_aperture_v: intrinsics.film_aperture_v,
            width,
            height,
            evaluations: Arc::clone(&evaluations),
            progress: self.progress.clone().map(Mutex::new),
        };

        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(observations.len() * 2, &["camera"], Box::new(cost), None);

        let (lower, upper) = self.params.bounds_for_vector();
        apply_bounds(&mut problem, &lower, &upper, &unlocked);

        let mut initial_values = HashMap::new();
        initial_values.insert("camera".to_string(), initial);

        let options = OptimizerOptions {
            max_iteration: self.max_evaluations,
            verbosity_level: 0,
            min_abs_error_decrease_threshold: self.tolerance,
            min_rel_error_decrease_threshold: self.tolerance,
            ..Default::default()
        };

        let solution = run_solver(method, &problem, &initial_values, options).ok_or_else(|| {
            OptimizeError::OptimizationFailed("solver did not produce a solution".to_string())
        })?;

        let winning = solution.get("camera").ok_or_else(|| {
            OptimizeError::OptimizationFailed("solver returned no camera block".to_string())
        })?;
        self.params.from_vector(winning.as_slice())?;

        let final_cost = stacked_residuals::<f64>(
            &observations,
            &base,
            &slots,
            intrinsics.film_aperture_h,
            intrinsics.film_aperture_v,
            width,
            height,
            winning,
        )
        .norm_squared();
        let iterations = evaluations.load(Ordering::Relaxed);

        let converged = self.verify_convergence(
            method,
            &observations,
            &base,
            &slots,
            &intrinsics,
            (&lower, &upper, &unlocked),
            winning,
            final_cost,
        );

        info!(
            "camera '{}' optimized: final cost {final_cost:.6} after {iterations} evaluations \
             (converged: {converged})",
            self.params.camera_id(),
        );

        Ok(OptimizationResult {
            converged,
            final_cost,
            iterations,
        })
    }

    /// Distinguish a tolerance stop from a budget stop. The solver reports
    /// neither, so run one further iteration from the winning point: a
    /// converged point gains less than the tolerance, a budget-limited stop
    /// still has progress left.
    #[allow(clippy::too_many_arguments)]
    fn verify_convergence(
        &self,
        method: OptimizeMethod,
        observations: &[(Point3<f64>, Vector2<f64>)],
        base: &[f64; PARAM_COUNT],
        slots: &[Option<usize>; PARAM_COUNT],
        intrinsics: &crate::camera::CameraIntrinsics,
        bounds: (&[f64], &[f64], &[ParamId]),
        winning: &DVector<f64>,
        final_cost: f64,
    ) -> bool {
        let width = self.resolution.width as f64;
        let height = self.resolution.height as f64;

        // Out-of-band probe: no progress events, no evaluation counting.
        let probe = ReprojectionCost {
            observations: observations.to_vec(),
            base: *base,
            slots: *slots,
            film_aperture_h: intrinsics.film_aperture_h,
            film_aperture_v: intrinsics.film_aperture_v,
            width,
            height,
            evaluations: Arc::new(AtomicUsize::new(0)),
            progress: None,
        };
        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(observations.len() * 2, &["camera"], Box::new(probe), None);
        let (lower, upper, unlocked) = bounds;
        apply_bounds(&mut problem, lower, upper, unlocked);

        let mut probe_initial = HashMap::new();
        probe_initial.insert("camera".to_string(), winning.clone());
        let options = OptimizerOptions {
            max_iteration: 1,
            verbosity_level: 0,
            min_abs_error_decrease_threshold: self.tolerance,
            min_rel_error_decrease_threshold: self.tolerance,
            ..Default::default()
        };

        match run_solver(method, &problem, &probe_initial, options)
            .and_then(|mut solution| solution.remove("camera"))
        {
            Some(probe_vector) => {
                let probe_cost = stacked_residuals::<f64>(
                    observations,
                    base,
                    slots,
                    intrinsics.film_aperture_h,
                    intrinsics.film_aperture_v,
                    width,
                    height,
                    &probe_vector,
                )
                .norm_squared();
                let decrease = final_cost - probe_cost;
                decrease <= self.tolerance.max(self.tolerance * final_cost)
            }
            None => false,
        }
    }
}

/// Sum of squared pixel errors over the currently valid correspondences.
pub fn total_squared_error<S: Scene>(
    scene: &S,
    params: &CameraParameterSet,
    pairs: &[Correspondence],
    resolution: Resolution,
) -> f64 {
    pairs
        .iter()
        .filter(|p| p.is_valid(scene))
        .map(|p| {
            let e = p.reprojection_error(scene, params, resolution);
            e * e
        })
        .sum()
}

/// Root-mean-square pixel error over the currently valid correspondences.
/// Infinite when no correspondence can be evaluated.
pub fn rms_error<S: Scene>(
    scene: &S,
    params: &CameraParameterSet,
    pairs: &[Correspondence],
    resolution: Resolution,
) -> f64 {
    let valid = pairs.iter().filter(|p| p.is_valid(scene)).count();
    if valid == 0 {
        return f64::INFINITY;
    }
    (total_squared_error(scene, params, pairs, resolution) / valid as f64).sqrt()
}

/// Pixel error per currently valid correspondence, keyed by pair id.
/// Invalid pairs are omitted; a valid pair whose projection fails reports
/// infinity.
pub fn per_correspondence_errors<S: Scene>(
    scene: &S,
    params: &CameraParameterSet,
    pairs: &[Correspondence],
    resolution: Resolution,
) -> Vec<(u64, f64)> {
    pairs
        .iter()
        .filter(|p| p.is_valid(scene))
        .map(|p| (p.id(), p.reprojection_error(scene, params, resolution)))
        .collect()
}
