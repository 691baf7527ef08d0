#![deny(rust_2018_idioms)]

//! Bundle adjustment for chessboard camera calibration.
//!
//! A joint nonlinear least-squares problem over the intrinsics of one or
//! more cameras, their poses, the per-frame poses of a moving calibration
//! board, optional isolated tracked points, and a parabolic board warp.
//! This crate owns the residual/Jacobian assembly, the unit-scale state
//! packing consumed by the solver, the statistical outlier policy, and the
//! covariance extraction from the factorized normal equations; the
//! minimizer itself is the external Levenberg-Marquardt solver, driven
//! through its [levenberg_marquardt::LeastSquaresProblem] callback.
//!
//! The projection math lives in [lens_geom].

mod covariance;
mod error;
mod jacobian;
mod observations;
mod outliers;
mod problem;
mod residuals;
mod state;

pub use crate::covariance::{CholeskyNormalEquations, CovarianceMatrices, NormalEquations};
pub use crate::error::{Error, Result};
pub use crate::jacobian::{
    n_jacobian_nonzero, n_measurements_all, n_measurements_boards, n_measurements_points,
    n_regularization_terms_per_camera, SparseJacobian,
};
pub use crate::observations::{
    BoardObservation, CornerObservation, PointObservation, RegionOfInterest, ROI_OUTSIDE_WEIGHT,
};
pub use crate::problem::{CalibrationData, CalibrationProblem, OptimizeOptions, OptimizeStats};
pub use crate::state::{
    Layout, ProblemDetails, DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M, POINT_MAXZ,
    SCALE_CALOBJECT_WARP, SCALE_DISTORTION, SCALE_INTRINSICS_CENTER_PIXEL,
    SCALE_INTRINSICS_FOCAL_LENGTH, SCALE_POSITION_POINT, SCALE_ROTATION_CAMERA,
    SCALE_ROTATION_FRAME, SCALE_TRANSLATION_CAMERA, SCALE_TRANSLATION_FRAME,
};

pub use lens_geom::{LensModel, Pose, SplinedConfig};
