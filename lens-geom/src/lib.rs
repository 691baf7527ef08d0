#![deny(rust_2018_idioms)]

//! Lens models and projection kernels for camera calibration.
//!
//! This crate knows how to map a 3D point through a lens model into pixel
//! coordinates, and how to report the analytic partial derivatives of that
//! mapping with respect to everything the calibration optimizer cares about:
//! the intrinsics, the camera pose, the calibration-object pose and the
//! object warp. The inverse mapping ([unproject]) runs the external
//! Levenberg-Marquardt solver against the projection residual.

mod api;
mod error;
mod models;
pub mod project;
mod rotation;

pub use crate::api::{
    project, project_z1, unproject, unproject_z1, Projected, ProjectionWants,
};
pub use crate::error::{Error, Result};
pub use crate::models::{LensModel, SplinedConfig};
pub use crate::rotation::{rodrigues, rotate_point, JointTransform, Pose, TransformedPoint};
