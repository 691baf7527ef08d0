//! Parameter covariance from the factorized normal equations.
//!
//! The solver works on the unit-scale state, so everything solved against
//! JtJ here comes back unitless and gets multiplied by the state scales on
//! both sides before it is reported in physical units.
//!
//! Three outputs:
//! - per-camera intrinsics covariance from the full inverse: solve
//!   JtJ X = S E over the camera's intrinsic block;
//! - per-camera intrinsics covariance from the observations alone: stream
//!   the observation rows of J through the factorization and accumulate the
//!   outer products of the intrinsic block of each solution column. This
//!   separates pixel noise from the regularization's prior-like pull;
//! - one joint extrinsics covariance over all 6(N-1) extrinsic variables.

use nalgebra::{Cholesky, DMatrix, Dyn};

use crate::error::{Error, Result};
use crate::jacobian::SparseJacobian;
use crate::state::Layout;

// cholmod solves in chunks of 4; same streaming granularity here
const CHUNK_SIZE: usize = 4;

/// The factorized normal equations, as an opaque capability: the covariance
/// extractor only ever asks it to solve against dense right-hand sides.
pub trait NormalEquations {
    fn n(&self) -> usize;
    /// Solve JtJ X = B in place.
    fn solve_in_place(&self, rhs: &mut DMatrix<f64>);
}

/// Dense Cholesky factorization of JtJ.
pub struct CholeskyNormalEquations {
    chol: Cholesky<f64, Dyn>,
    n: usize,
}

impl CholeskyNormalEquations {
    pub fn factorize(jacobian: &SparseJacobian) -> Result<Self> {
        let jtj = jacobian.jtj();
        let n = jtj.nrows();
        let chol = Cholesky::new(jtj).ok_or(Error::SingularNormalEquations)?;
        Ok(CholeskyNormalEquations { chol, n })
    }
}

impl NormalEquations for CholeskyNormalEquations {
    fn n(&self) -> usize {
        self.n
    }

    fn solve_in_place(&self, rhs: &mut DMatrix<f64>) {
        self.chol.solve_mut(rhs);
    }
}

/// Covariance matrices in physical units, already scaled by the observed
/// pixel uncertainty.
#[derive(Debug, Clone)]
pub struct CovarianceMatrices {
    /// Per camera, the intrinsic block of inv(JtJ).
    pub intrinsics_full: Vec<DMatrix<f64>>,
    /// Per camera, the intrinsic covariance induced by pixel noise alone.
    pub intrinsics_from_observations: Vec<DMatrix<f64>>,
    /// One `6(N-1) x 6(N-1)` block over every camera's extrinsics. `None`
    /// when the extrinsics are not being optimized (or there is one camera).
    pub extrinsics: Option<DMatrix<f64>>,
}

impl CovarianceMatrices {
    /// The shape [compute_uncertainty] would report, filled with NaN.
    pub(crate) fn nan(layout: &Layout) -> Self {
        let n_intr = layout.n_intrinsics_optimization_params();
        let nan_block = DMatrix::from_element(n_intr, n_intr, f64::NAN);
        let n_extr = 6 * (layout.ncameras - 1);
        CovarianceMatrices {
            intrinsics_full: vec![nan_block.clone(); layout.ncameras],
            intrinsics_from_observations: vec![nan_block; layout.ncameras],
            extrinsics: (layout.details.do_optimize_extrinsics && layout.ncameras > 1)
                .then(|| DMatrix::from_element(n_extr, n_extr, f64::NAN)),
        }
    }
}

pub(crate) fn compute_uncertainty(
    factorization: &dyn NormalEquations,
    jacobian: &SparseJacobian,
    observed_pixel_uncertainty: f64,
    layout: &Layout,
    n_meas_observations: usize,
) -> Result<CovarianceMatrices> {
    if n_meas_observations == 0 {
        return Err(Error::InconsistentData("no observations to propagate noise from"));
    }

    let details = &layout.details;
    let want_intrinsics =
        details.do_optimize_intrinsic_core || details.do_optimize_intrinsic_distortions;
    // a partial intrinsic state cannot be unpacked into a full covariance
    // block
    let whole_intrinsics =
        layout.n_intrinsics_optimization_params() == layout.model.n_lens_params();
    if want_intrinsics && !whole_intrinsics {
        return Err(Error::InconsistentData(
            "intrinsics covariance requires optimizing the whole intrinsics",
        ));
    }
    let want_extrinsics = details.do_optimize_extrinsics && layout.ncameras > 1;
    if !want_intrinsics && !want_extrinsics {
        return Ok(CovarianceMatrices {
            intrinsics_full: vec![],
            intrinsics_from_observations: vec![],
            extrinsics: None,
        });
    }

    let nstate = layout.n_state();
    debug_assert_eq!(factorization.n(), nstate);
    let n_intr = layout.n_intrinsics_optimization_params();
    let sigma2 = observed_pixel_uncertainty * observed_pixel_uncertainty;

    // the full-inverse intrinsic blocks: solve against scaled selector
    // columns of each camera's intrinsic state
    let mut intrinsics_full = Vec::new();
    if want_intrinsics {
        for i_camera in 0..layout.ncameras {
            let istate0 = layout.index_intrinsics(i_camera);
            let mut block = DMatrix::zeros(n_intr, n_intr);
            let mut j0 = 0;
            while j0 < n_intr {
                let ncols = (n_intr - j0).min(CHUNK_SIZE);
                let mut rhs = DMatrix::zeros(nstate, ncols);
                for c in 0..ncols {
                    rhs[(istate0 + j0 + c, c)] = layout.intrinsics_scale(j0 + c);
                }
                factorization.solve_in_place(&mut rhs);
                for c in 0..ncols {
                    for i in 0..n_intr {
                        block[(i, j0 + c)] =
                            rhs[(istate0 + i, c)] * layout.intrinsics_scale(i);
                    }
                }
                j0 += ncols;
            }
            intrinsics_full.push(block * sigma2);
        }
    }

    // the observation-noise accumulation: stream rows of J through the
    // factorization and sum outer products of the blocks of interest
    let scales = layout.scales();
    let mut intrinsics_obs = if want_intrinsics {
        vec![DMatrix::<f64>::zeros(n_intr, n_intr); layout.ncameras]
    } else {
        vec![]
    };
    let n_extr = 6 * (layout.ncameras - 1);
    let mut extrinsics_cov = want_extrinsics.then(|| DMatrix::<f64>::zeros(n_extr, n_extr));
    let istate_extrinsics0 = want_extrinsics.then(|| layout.index_camera_rt(1));

    let mut i_meas = 0;
    while i_meas < n_meas_observations {
        let ncols = (n_meas_observations - i_meas).min(CHUNK_SIZE);
        let mut rhs = DMatrix::zeros(nstate, ncols);
        for c in 0..ncols {
            let (cols, vals) = jacobian.row(i_meas + c);
            for (&col, &val) in cols.iter().zip(vals) {
                rhs[(col, c)] = val;
            }
        }
        factorization.solve_in_place(&mut rhs);

        for c in 0..ncols {
            // unitless solution -> physical units
            for i in 0..nstate {
                rhs[(i, c)] *= scales[i];
            }

            for (i_camera, block) in intrinsics_obs.iter_mut().enumerate() {
                let base = layout.index_intrinsics(i_camera);
                for i0 in 0..n_intr {
                    let x0 = rhs[(base + i0, c)];
                    block[(i0, i0)] += x0 * x0;
                    for i1 in (i0 + 1)..n_intr {
                        let x0x1 = x0 * rhs[(base + i1, c)];
                        block[(i0, i1)] += x0x1;
                        block[(i1, i0)] += x0x1;
                    }
                }
            }
            if let Some(ecov) = &mut extrinsics_cov {
                let base = istate_extrinsics0.unwrap();
                for i0 in 0..n_extr {
                    let x0 = rhs[(base + i0, c)];
                    ecov[(i0, i0)] += x0 * x0;
                    for i1 in (i0 + 1)..n_extr {
                        let x0x1 = x0 * rhs[(base + i1, c)];
                        ecov[(i0, i1)] += x0x1;
                        ecov[(i1, i0)] += x0x1;
                    }
                }
            }
        }
        i_meas += ncols;
    }

    for block in &mut intrinsics_obs {
        *block *= sigma2;
    }
    if let Some(ecov) = &mut extrinsics_cov {
        *ecov *= sigma2;
    }

    Ok(CovarianceMatrices {
        intrinsics_full,
        intrinsics_from_observations: intrinsics_obs,
        extrinsics: extrinsics_cov,
    })
}
