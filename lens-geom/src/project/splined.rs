//! Splined-stereographic projection.
//!
//! The normalized stereographic coordinate u = 2 (x, y) / (|p| + z) indexes
//! two independent cubic-B-spline surfaces of focal-length scalings. The
//! pixel is (ux fx(u) + cx, uy fy(u) + cy) with cx, cy fixed by the model
//! configuration. Each projection touches a 4x4 tile of control points, and
//! the intrinsics gradient over that tile is the outer product of the
//! separable sample coefficients scaled by u.

use nalgebra::{Matrix2x3, Vector3};

use crate::models::SplinedConfig;

/// The sparse intrinsics-gradient descriptor of one splined projection: a
/// contiguous run of control-point variables starting at `ivar0`, of side
/// length [SplinedRun::SIDE], with row stride `2 nx` in the intrinsics
/// vector.
#[derive(Debug, Clone, Copy)]
pub struct SplinedRun {
    pub ivar0: usize,
    pub abcd_x: [f64; 4],
    pub abcd_y: [f64; 4],
    pub u: [f64; 2],
}

impl SplinedRun {
    pub const SIDE: usize = 4;

    /// Distance in the intrinsics vector between consecutive tile rows.
    pub fn stride(nx: u16) -> usize {
        2 * nx as usize
    }

    /// dq_{i_xy} / d(control point at tile coordinate (ix, iy)); the control
    /// point's variable index is `ivar0 + iy stride + 2 ix + i_xy`.
    pub fn coefficient(&self, ix: usize, iy: usize, i_xy: usize) -> f64 {
        self.abcd_x[ix] * self.abcd_y[iy] * self.u[i_xy]
    }
}

// Uniform cubic B-spline sampling between the middle two of four sequential
// control points, x in [0, 1], plus the derivative coefficients.
fn sample_coeffs(x: f64) -> ([f64; 4], [f64; 4]) {
    let x2 = x * x;
    let x3 = x2 * x;
    let abcd = [
        (-x3 + 3.0 * x2 - 3.0 * x + 1.0) / 6.0,
        (3.0 * x3 / 2.0 - 3.0 * x2 + 2.0) / 3.0,
        (-3.0 * x3 + 3.0 * x2 + 3.0 * x + 1.0) / 6.0,
        x3 / 6.0,
    ];
    let grad = [
        -x2 / 2.0 + x - 0.5,
        3.0 * x2 / 2.0 - 2.0 * x,
        -3.0 * x2 / 2.0 + x + 0.5,
        x2 / 2.0,
    ];
    (abcd, grad)
}

pub(super) struct Projection {
    pub q: [f64; 2],
    pub dq_dp: Matrix2x3<f64>,
    pub run: SplinedRun,
}

pub(super) fn project(config: &SplinedConfig, intrinsics: &[f64], p: &Vector3<f64>) -> Projection {
    let mag = p.norm();
    let scale = 2.0 / (mag + p.z);
    let u = [p.x * scale, p.y * scale];

    // du/dp = pxy dscale/dp + [I; 0], dscale/dp = a ([0,0,1] + p b)
    let a = -scale * scale / 2.0;
    let b = 1.0 / mag;
    let du_dp = Matrix2x3::new(
        p.x * a * b * p.x + 1.0,
        p.x * a * b * p.y,
        p.x * (a * b * p.z + a),
        p.y * a * b * p.x,
        p.y * a * b * p.y + 1.0,
        p.y * (a * b * p.z + a),
    );

    // Control points span the stereographic image of the declared field of
    // view, with one whole extra knot interval past each edge for the cubic
    // surface.
    let n_extra_intervals = 2u16;
    let th_edge = (config.fov_x_deg / 2.0).to_radians();
    let u_edge = (th_edge / 2.0).tan() * 2.0;
    let interval = u_edge * 2.0 / f64::from(config.nx - 1 - n_extra_intervals);

    let ix = u[0] / interval + f64::from(config.nx - 1) / 2.0;
    let iy = u[1] / interval + f64::from(config.ny - 1) / 2.0;
    // keep the 4x4 tile inside the grid; points past the declared FOV
    // extrapolate off the edge tile
    let ix0 = (ix.floor() as i64).clamp(1, i64::from(config.nx) - 3) as usize;
    let iy0 = (iy.floor() as i64).clamp(1, i64::from(config.ny) - 3) as usize;

    let stride_y = SplinedRun::stride(config.nx);
    let ivar0 = 2 * ((iy0 - 1) * config.nx as usize + (ix0 - 1));

    let (abcd_x, grad_x) = sample_coeffs(ix - ix0 as f64);
    let (abcd_y, grad_y) = sample_coeffs(iy - iy0 as f64);

    // sample both focal-length surfaces at once
    let ctrl = |ty: usize, tx: usize, k: usize| intrinsics[ivar0 + ty * stride_y + 2 * tx + k];
    let interp = |wx: &[f64; 4], wy: &[f64; 4]| -> [f64; 2] {
        let mut out = [0.0; 2];
        for k in 0..2 {
            for (ty, cy) in wy.iter().enumerate() {
                let row: f64 = (0..4).map(|tx| wx[tx] * ctrl(ty, tx, k)).sum();
                out[k] += cy * row;
            }
        }
        out
    };
    let f = interp(&abcd_x, &abcd_y);
    // the sample coefficients run on the knot fraction; dividing by the
    // interval converts their derivatives to the stereographic coordinate
    let df_dux = interp(&grad_x, &abcd_y).map(|v| v / interval);
    let df_duy = interp(&abcd_x, &grad_y).map(|v| v / interval);

    let q = [u[0] * f[0] + config.cx, u[1] * f[1] + config.cy];

    // dqx/dp = (ux dfx/dux + fx) dux/dp + ux dfx/duy duy/dp, same for y
    let s0 = u[0] * df_dux[0] + f[0];
    let s1 = u[0] * df_duy[0];
    let row0 = du_dp.row(0) * s0 + du_dp.row(1) * s1;
    let t0 = u[1] * df_duy[1] + f[1];
    let t1 = u[1] * df_dux[1];
    let row1 = du_dp.row(1) * t0 + du_dp.row(0) * t1;
    let dq_dp = Matrix2x3::from_rows(&[row0, row1]);

    Projection {
        q,
        dq_dp,
        run: SplinedRun { ivar0, abcd_x, abcd_y, u },
    }
}
