//! The calibration problem: parameter ownership, solver integration, and
//! the outer optimize driver.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DVector, Dyn, OMatrix, Owned, Vector3};

use lens_geom::{LensModel, Pose};

use crate::covariance::{compute_uncertainty, CholeskyNormalEquations, CovarianceMatrices};
use crate::error::{Error, Result};
use crate::jacobian::{
    n_jacobian_nonzero, n_measurements_all, n_measurements_boards, n_measurements_points,
    n_regularization_terms_per_camera, JacobianBuilder, NullWriter, SparseJacobian,
};
use crate::observations::{roi_weight, BoardObservation, PointObservation, RegionOfInterest};
use crate::outliers::mark_outliers;
use crate::residuals::{assemble, Assembly};
use crate::state::{Layout, ProblemDetails};

/// Everything the optimization consumes. The parameter vectors are seeds;
/// the solved values come back through [CalibrationProblem]'s accessors.
#[derive(Debug, Clone)]
pub struct CalibrationData {
    pub model: LensModel,
    pub details: ProblemDetails,
    /// `ncameras * n_lens_params()` values, camera-major.
    pub intrinsics: Vec<f64>,
    /// One pose per camera past camera 0, mapping reference coordinates into
    /// that camera's frame.
    pub extrinsics: Vec<Pose>,
    /// One pose per frame, mapping calibration-object coordinates into the
    /// reference frame.
    pub frames: Vec<Pose>,
    /// Tracked points, in the reference frame.
    pub points: Vec<Vector3<f64>>,
    pub calobject_warp: Option<[f64; 2]>,
    pub observations_board: Vec<BoardObservation>,
    pub observations_point: Vec<PointObservation>,
    /// (width, height) per camera.
    pub imagersizes: Vec<[u32; 2]>,
    pub roi: Option<Vec<RegionOfInterest>>,
    pub object_spacing: f64,
    pub object_width_n: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizeOptions {
    pub observed_pixel_uncertainty: f64,
    pub skip_outlier_rejection: bool,
    pub compute_covariances: bool,
    pub verbose: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        OptimizeOptions {
            observed_pixel_uncertainty: 1.0,
            skip_outlier_rejection: false,
            compute_covariances: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizeStats {
    pub rms_reproj_error_px: f64,
    pub n_outliers: usize,
    /// Board features (corner indices over all board observations, in
    /// residual order) marked as outliers.
    pub outlier_indices: Vec<usize>,
    /// Board features whose observation fell outside the region of interest.
    pub outside_roi_indices: Vec<usize>,
    /// The final residual vector.
    pub x_final: Vec<f64>,
    pub covariances: Option<CovarianceMatrices>,
}

/// The joint calibration problem. Owns the current parameter estimates and
/// the persistent outlier bitmap, and exposes the residual/Jacobian
/// assembly to the external Levenberg-Marquardt solver.
#[derive(Debug, Clone)]
pub struct CalibrationProblem {
    data: CalibrationData,
    layout: Layout,
    outliers: Vec<bool>,
    packed: DVector<f64>,
    n_measurements: usize,
    n_jacobian_nonzero: usize,
}

impl CalibrationProblem {
    pub fn new(mut data: CalibrationData) -> Result<Self> {
        let ncameras = data.imagersizes.len();
        if ncameras == 0 {
            return Err(Error::InconsistentData("no cameras"));
        }
        if data.extrinsics.len() + 1 != ncameras {
            return Err(Error::InconsistentData("extrinsics shape"));
        }
        if data.intrinsics.len() != ncameras * data.model.n_lens_params() {
            return Err(Error::InconsistentData("intrinsics shape"));
        }
        if data.object_width_n < 2 && !data.observations_board.is_empty() {
            return Err(Error::InconsistentData("degenerate calibration object"));
        }
        let w2 = data.object_width_n * data.object_width_n;
        for obs in &data.observations_board {
            if obs.corners.len() != w2 {
                return Err(Error::InconsistentData("board corner-grid shape"));
            }
            if obs.i_camera >= ncameras {
                return Err(Error::InconsistentData("board camera index out of range"));
            }
            if obs.i_frame >= data.frames.len() {
                return Err(Error::InconsistentData("board frame index out of range"));
            }
        }
        for obs in &data.observations_point {
            if obs.i_camera >= ncameras {
                return Err(Error::InconsistentData("point camera index out of range"));
            }
            if obs.i_point >= data.points.len() {
                return Err(Error::InconsistentData("point index out of range"));
            }
        }
        if let Some(roi) = &data.roi {
            if roi.len() != ncameras {
                return Err(Error::InconsistentData("roi shape"));
            }
        }
        if data.model == LensModel::Cahvore
            && !(data.observations_board.is_empty() && data.observations_point.is_empty())
        {
            return Err(Error::InconsistentData(
                "CAHVORE has no gradients and cannot be optimized",
            ));
        }
        if data.details.do_optimize_calobject_warp && data.calobject_warp.is_none() {
            return Err(Error::InconsistentData(
                "optimizing the calibration-object warp requires a warp seed",
            ));
        }
        // models without a core have no core state to optimize
        if !data.model.has_core() {
            data.details.do_optimize_intrinsic_core = false;
        }

        let layout = Layout {
            model: data.model,
            details: data.details,
            ncameras,
            nframes: data.frames.len(),
            npoints: data.points.len(),
        };
        let packed = layout.pack(
            &data.intrinsics,
            &data.extrinsics,
            &data.frames,
            &data.points,
            data.calobject_warp.as_ref(),
        );
        let n_measurements = n_measurements_all(
            &layout,
            data.observations_board.len(),
            &data.observations_point,
            data.object_width_n,
        );
        let n_nonzero = n_jacobian_nonzero(
            &layout,
            &data.observations_board,
            &data.observations_point,
            data.object_width_n,
        );
        let n_features = data.observations_board.len() * w2;

        Ok(CalibrationProblem {
            data,
            layout,
            outliers: vec![false; n_features],
            packed,
            n_measurements,
            n_jacobian_nonzero: n_nonzero,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn model(&self) -> &LensModel {
        &self.data.model
    }

    pub fn intrinsics(&self) -> &[f64] {
        &self.data.intrinsics
    }

    pub fn extrinsics(&self) -> &[Pose] {
        &self.data.extrinsics
    }

    pub fn frames(&self) -> &[Pose] {
        &self.data.frames
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.data.points
    }

    pub fn calobject_warp(&self) -> Option<[f64; 2]> {
        self.data.calobject_warp
    }

    pub fn outliers(&self) -> &[bool] {
        &self.outliers
    }

    pub fn n_measurements(&self) -> usize {
        self.n_measurements
    }

    pub fn n_jacobian_nonzero(&self) -> usize {
        self.n_jacobian_nonzero
    }

    pub fn packed_state(&self) -> &DVector<f64> {
        &self.packed
    }

    /// Mark these board features as outliers before the solve.
    pub fn seed_outliers(&mut self, feature_indices: &[usize]) {
        for &i in feature_indices {
            self.outliers[i] = true;
        }
    }

    fn assembly(&self) -> Assembly<'_> {
        Assembly {
            layout: self.layout,
            intrinsics: &self.data.intrinsics,
            extrinsics: &self.data.extrinsics,
            frames: &self.data.frames,
            points: &self.data.points,
            calobject_warp: self.data.calobject_warp,
            observations_board: &self.data.observations_board,
            observations_point: &self.data.observations_point,
            roi: self.data.roi.as_deref(),
            imagersizes: &self.data.imagersizes,
            object_spacing: self.data.object_spacing,
            object_width_n: self.data.object_width_n,
            outliers: &self.outliers,
            n_measurements: self.n_measurements,
        }
    }

    /// The weighted residual vector at the current parameters.
    pub fn residuals_vec(&self) -> Result<DVector<f64>> {
        let mut x = DVector::zeros(self.n_measurements);
        assemble(&self.assembly(), x.as_mut_slice(), &mut NullWriter)?;
        Ok(x)
    }

    /// The sparse Jacobian at the current parameters. Writes exactly
    /// [Self::n_jacobian_nonzero] entries.
    pub fn sparse_jacobian(&self) -> Result<SparseJacobian> {
        let mut x = DVector::zeros(self.n_measurements);
        let mut builder = JacobianBuilder::new(
            self.n_measurements,
            self.layout.n_state(),
            self.n_jacobian_nonzero,
        );
        assemble(&self.assembly(), x.as_mut_slice(), &mut builder)?;
        Ok(builder.finish())
    }

    /// Run the solve: minimize, re-mark outliers, repeat; then extract the
    /// requested covariances from the final factorization.
    pub fn optimize(mut self, opts: &OptimizeOptions) -> Result<(Self, OptimizeStats)> {
        loop {
            let (solved, report) = LevenbergMarquardt::new().minimize(self);
            self = solved;
            if !report.objective_function.is_finite() {
                return Err(Error::SolverFailure);
            }

            if opts.skip_outlier_rejection {
                break;
            }
            let x = self.residuals_vec()?;
            let (marked_any, n_marked) = mark_outliers(
                &mut self.outliers,
                &self.data.observations_board,
                self.data.roi.as_deref(),
                x.as_slice(),
                opts.observed_pixel_uncertainty,
            );
            if !marked_any {
                break;
            }
            tracing::debug!("marked new outliers ({n_marked} total); re-running the solve");
        }

        let x = self.residuals_vec()?;
        let norm2 = x.norm_squared();
        // /2: separate x and y measurements
        let rms_reproj_error_px = (norm2 / (self.n_measurements as f64 / 2.0)).sqrt();

        if opts.verbose && !self.layout.details.do_skip_regularization {
            let n_reg = self.layout.ncameras * n_regularization_terms_per_camera(&self.layout);
            let norm2_reg: f64 = x
                .as_slice()
                .iter()
                .skip(self.n_measurements - n_reg)
                .map(|v| v * v)
                .sum();
            tracing::info!(
                "regularization cost ratio: {:.3e}",
                norm2_reg / (norm2 - norm2_reg)
            );
        }

        let covariances = if opts.compute_covariances {
            let jacobian = self.sparse_jacobian()?;
            let n_meas_observations =
                n_measurements_boards(self.data.observations_board.len(), self.data.object_width_n)
                    + n_measurements_points(&self.data.observations_point);
            let result = CholeskyNormalEquations::factorize(&jacobian).and_then(|f| {
                compute_uncertainty(
                    &f,
                    &jacobian,
                    opts.observed_pixel_uncertainty,
                    &self.layout,
                    n_meas_observations,
                )
            });
            Some(match result {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("covariance extraction failed ({e}); reporting NaN");
                    CovarianceMatrices::nan(&self.layout)
                }
            })
        } else {
            None
        };

        let outlier_indices: Vec<usize> = self
            .outliers
            .iter()
            .enumerate()
            .filter_map(|(i, &marked)| marked.then_some(i))
            .collect();

        let mut outside_roi_indices = Vec::new();
        if self.data.roi.is_some() {
            let mut i_feature = 0;
            for obs in &self.data.observations_board {
                for corner in &obs.corners {
                    let w = roi_weight(
                        self.data.roi.as_deref(),
                        obs.i_camera,
                        corner.x,
                        corner.y,
                    );
                    if w != 1.0 {
                        outside_roi_indices.push(i_feature);
                    }
                    i_feature += 1;
                }
            }
        }

        let stats = OptimizeStats {
            rms_reproj_error_px,
            n_outliers: outlier_indices.len(),
            outlier_indices,
            outside_roi_indices,
            x_final: x.as_slice().to_vec(),
            covariances,
        };
        Ok((self, stats))
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for CalibrationProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.packed = x.clone();
        self.layout.unpack(
            x,
            &mut self.data.intrinsics,
            &mut self.data.extrinsics,
            &mut self.data.frames,
            &mut self.data.points,
            self.data.calobject_warp.as_mut(),
        );
    }

    fn params(&self) -> DVector<f64> {
        self.packed.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.residuals_vec().ok()
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, Dyn>> {
        Some(self.sparse_jacobian().ok()?.to_dense())
    }
}
