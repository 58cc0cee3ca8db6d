//! Camera Match Library
//!
//! A Rust library for single-camera resection: estimating a camera's pose and
//! intrinsics (translation, rotation, focal length, film offsets) from a set
//! of known 3D-point-to-2D-pixel correspondences by minimizing pixel
//! reprojection error.
//!
//! The library provides:
//! - A perspective projection model mapping 3D world points through a camera
//!   transform and film-back intrinsics to normalized device coordinates and
//!   image pixels
//! - A camera parameter set with per-parameter locking and bound constraints
//! - A bounded nonlinear least-squares optimizer built on the tiny-solver
//!   optimization framework
//! - A [`matcher::CameraMatcher`] facade that manages correspondences and
//!   drives the optimization against an external scene
//!
//! Scene storage, file persistence and any user interface are deliberately
//! out of scope; callers supply them through the [`scene::Scene`] trait and
//! the serializable snapshot types.

pub mod camera;
pub mod correspondence;
pub mod geometry;
pub mod matcher;
pub mod optimization;
pub mod scene;

// Re-export commonly used types
pub use camera::{
    CameraExtrinsics, CameraIntrinsics, CameraParamError, CameraParameterSet, CameraSnapshot,
    ParamId, ParameterConstraint, Resolution,
};

pub use correspondence::Correspondence;

pub use matcher::{CameraMatcher, PairSnapshot, SessionSnapshot};

pub use optimization::{
    CameraOptimizer, OptimizationResult, OptimizeError, OptimizeMethod, ProgressEvent,
};

pub use scene::{AnchorId, MemoryScene, Scene, SceneError};
