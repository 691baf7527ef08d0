//! Sparse Jacobian storage and the measurement/non-zero counting functions.
//!
//! The assembler emits compressed-sparse-row data: one `row_ptr` entry per
//! measurement, column indices in packed-state order. The counting functions
//! are pure; the assembler must write exactly the predicted number of
//! entries on every call.

use nalgebra::DMatrix;

use lens_geom::project::SplinedRun;
use lens_geom::LensModel;

use crate::observations::PointObservation;
use crate::state::Layout;

/// A compressed-sparse-row Jacobian.
#[derive(Debug, Clone)]
pub struct SparseJacobian {
    nrows: usize,
    ncols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseJacobian {
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn n_nonzero(&self) -> usize {
        self.values.len()
    }

    /// Column indices and values of row `i`.
    pub fn row(&self, i: usize) -> (&[usize], &[f64]) {
        let span = self.row_ptr[i]..self.row_ptr[i + 1];
        (&self.col_idx[span.clone()], &self.values[span])
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.nrows, self.ncols);
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            for (&c, &v) in cols.iter().zip(vals) {
                m[(i, c)] += v;
            }
        }
        m
    }

    /// Dense Jt J, the normal-equations matrix the factorization consumes.
    pub fn jtj(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.ncols, self.ncols);
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            for (k0, (&c0, &v0)) in cols.iter().zip(vals).enumerate() {
                for (&c1, &v1) in cols.iter().zip(vals).skip(k0) {
                    m[(c0, c1)] += v0 * v1;
                    if c0 != c1 {
                        m[(c1, c0)] += v0 * v1;
                    }
                }
            }
        }
        m
    }
}

/// Where the assembler writes Jacobian entries. The residual-only passes use
/// [NullWriter]; real passes use [JacobianBuilder].
pub(crate) trait JacobianWriter {
    fn begin_row(&mut self);
    fn put(&mut self, col: usize, value: f64);

    fn put2(&mut self, col0: usize, g0: f64, g1: f64) {
        self.put(col0, g0);
        self.put(col0 + 1, g1);
    }

    fn put3(&mut self, col0: usize, g0: f64, g1: f64, g2: f64) {
        self.put(col0, g0);
        self.put(col0 + 1, g1);
        self.put(col0 + 2, g2);
    }
}

pub(crate) struct NullWriter;

impl JacobianWriter for NullWriter {
    fn begin_row(&mut self) {}
    fn put(&mut self, _col: usize, _value: f64) {}
}

pub(crate) struct JacobianBuilder {
    nrows: usize,
    ncols: usize,
    expected_nonzero: usize,
    rows_begun: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl JacobianBuilder {
    pub fn new(nrows: usize, ncols: usize, expected_nonzero: usize) -> Self {
        let mut row_ptr = Vec::with_capacity(nrows + 1);
        row_ptr.push(0);
        JacobianBuilder {
            nrows,
            ncols,
            expected_nonzero,
            rows_begun: 0,
            row_ptr,
            col_idx: Vec::with_capacity(expected_nonzero),
            values: Vec::with_capacity(expected_nonzero),
        }
    }

    pub fn finish(mut self) -> SparseJacobian {
        self.row_ptr.push(self.col_idx.len());
        assert_eq!(self.rows_begun, self.nrows, "assembler row count is off");
        assert_eq!(
            self.col_idx.len(),
            self.expected_nonzero,
            "assembler wrote an unexpected number of Jacobian entries"
        );
        SparseJacobian {
            nrows: self.nrows,
            ncols: self.ncols,
            row_ptr: self.row_ptr,
            col_idx: self.col_idx,
            values: self.values,
        }
    }
}

impl JacobianWriter for JacobianBuilder {
    fn begin_row(&mut self) {
        if self.rows_begun > 0 {
            self.row_ptr.push(self.col_idx.len());
        }
        self.rows_begun += 1;
    }

    fn put(&mut self, col: usize, value: f64) {
        debug_assert!(col < self.ncols);
        self.col_idx.push(col);
        self.values.push(value);
    }
}

pub fn n_measurements_boards(n_board_observations: usize, object_width_n: usize) -> usize {
    // x and y are separate measurements
    n_board_observations * object_width_n * object_width_n * 2
}

pub fn n_measurements_points(observations_point: &[PointObservation]) -> usize {
    observations_point.len() * 2
        + observations_point.iter().filter(|o| o.has_range()).count()
}

pub fn n_regularization_terms_per_camera(layout: &Layout) -> usize {
    if layout.details.do_skip_regularization {
        return 0;
    }
    if matches!(layout.model, LensModel::SplinedStereographic(_)) {
        return 0;
    }
    let mut n = layout.n_distortion_optimization_params();
    if layout.details.do_optimize_intrinsic_core {
        n += 2;
    }
    n
}

pub fn n_measurements_all(
    layout: &Layout,
    n_board_observations: usize,
    observations_point: &[PointObservation],
    object_width_n: usize,
) -> usize {
    n_measurements_boards(n_board_observations, object_width_n)
        + n_measurements_points(observations_point)
        + layout.ncameras * n_regularization_terms_per_camera(layout)
}

/// Jacobian entries per residual row for the intrinsics of one camera.
pub(crate) fn n_intrinsics_per_row(layout: &Layout) -> usize {
    let mut n = 0;
    // x depends on fx, cx but not fy, cy; likewise for y
    if layout.details.do_optimize_intrinsic_core && layout.model.has_core() {
        n += 2;
    }
    if layout.details.do_optimize_intrinsic_distortions {
        n += match layout.model {
            // the 4x4 control-point tile, not the whole surface
            LensModel::SplinedStereographic(_) => SplinedRun::SIDE * SplinedRun::SIDE,
            ref model => model.n_distortion_params(),
        };
    }
    n
}

/// The exact number of Jacobian non-zeros the assembler will write.
pub fn n_jacobian_nonzero(
    layout: &Layout,
    observations_board: &[crate::observations::BoardObservation],
    observations_point: &[PointObservation],
    object_width_n: usize,
) -> usize {
    let details = &layout.details;
    let n_intr_row = n_intrinsics_per_row(layout);
    let per_row_base = n_intr_row
        + if details.do_optimize_frames { 6 } else { 0 }
        + if details.do_optimize_calobject_warp { 2 } else { 0 };

    let mut n = 0;
    for obs in observations_board {
        let n_extr =
            if details.do_optimize_extrinsics && obs.i_camera != 0 { 6 } else { 0 };
        n += 2 * object_width_n * object_width_n * (per_row_base + n_extr);
    }

    for obs in observations_point {
        let n_extr =
            if details.do_optimize_extrinsics && obs.i_camera != 0 { 6 } else { 0 };
        let n_point = if details.do_optimize_frames { 3 } else { 0 };
        n += 2 * (n_intr_row + n_extr + n_point);
        if obs.has_range() {
            n += n_extr + n_point;
        }
    }

    // each regularization row touches exactly one variable
    n + layout.ncameras * n_regularization_terms_per_camera(layout)
}
