//! Radial-tangential ("OpenCV"-family) distortion with analytic gradients.
//!
//! This is the "project with gradients" primitive behind OPENCV4/5/8/12.
//! The distortion vector is the usual OpenCV ordering:
//! `k1 k2 p1 p2 [k3 [k4 k5 k6 [s1 s2 s3 s4]]]` where k4..k6 form the
//! rational denominator and s1..s4 the thin-prism terms. `dq/d(fx,fy)` is
//! diagonal: x depends on fx only and y on fy only.

use nalgebra::{Matrix2x3, Vector3};

use super::MAX_DISTORTION_PARAMS;

pub(super) struct Projection {
    pub q: [f64; 2],
    pub dq_dp: Matrix2x3<f64>,
    pub dq_dfxy: [f64; 2],
    pub nocore: [[f64; MAX_DISTORTION_PARAMS]; 2],
}

pub(super) fn project(intrinsics: &[f64], n_dist: usize, p: &Vector3<f64>) -> Projection {
    let (fx, fy, cx, cy) = (intrinsics[0], intrinsics[1], intrinsics[2], intrinsics[3]);
    let dist = &intrinsics[4..4 + n_dist];
    let coeff = |i: usize| if i < n_dist { dist[i] } else { 0.0 };
    let (k1, k2, p1, p2) = (coeff(0), coeff(1), coeff(2), coeff(3));
    let k3 = coeff(4);
    let (k4, k5, k6) = (coeff(5), coeff(6), coeff(7));
    let (s1, s2, s3, s4) = (coeff(8), coeff(9), coeff(10), coeff(11));

    let z_recip = 1.0 / p.z;
    let x = p.x * z_recip;
    let y = p.y * z_recip;
    let r2 = x * x + y * y;
    let r4 = r2 * r2;
    let r6 = r4 * r2;

    let num = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
    let den = 1.0 + r2 * (k4 + r2 * (k5 + r2 * k6));
    let den_recip = 1.0 / den;
    let radial = num * den_recip;

    let a1 = 2.0 * x * y;
    let a2 = r2 + 2.0 * x * x;
    let a3 = r2 + 2.0 * y * y;

    let xd = x * radial + p1 * a1 + p2 * a2 + s1 * r2 + s2 * r4;
    let yd = y * radial + p1 * a3 + p2 * a1 + s3 * r2 + s4 * r4;

    let q = [fx * xd + cx, fy * yd + cy];

    // d(num/den)/dr2
    let dnum_dr2 = k1 + r2 * (2.0 * k2 + 3.0 * k3 * r2);
    let dden_dr2 = k4 + r2 * (2.0 * k5 + 3.0 * k6 * r2);
    let dradial_dr2 = (dnum_dr2 - radial * dden_dr2) * den_recip;

    let dxd_dx = radial + 2.0 * x * x * dradial_dr2
        + 2.0 * p1 * y
        + 6.0 * p2 * x
        + 2.0 * s1 * x
        + 4.0 * s2 * r2 * x;
    let dxd_dy = 2.0 * x * y * dradial_dr2
        + 2.0 * p1 * x
        + 2.0 * p2 * y
        + 2.0 * s1 * y
        + 4.0 * s2 * r2 * y;
    let dyd_dx = 2.0 * x * y * dradial_dr2
        + 2.0 * p1 * x
        + 2.0 * p2 * y
        + 2.0 * s3 * x
        + 4.0 * s4 * r2 * x;
    let dyd_dy = radial + 2.0 * y * y * dradial_dr2
        + 6.0 * p1 * y
        + 2.0 * p2 * x
        + 2.0 * s3 * y
        + 4.0 * s4 * r2 * y;

    // chain through x = px/pz, y = py/pz
    let dx_dp = [z_recip, 0.0, -x * z_recip];
    let dy_dp = [0.0, z_recip, -y * z_recip];
    let mut dq_dp = Matrix2x3::zeros();
    for i in 0..3 {
        dq_dp[(0, i)] = fx * (dxd_dx * dx_dp[i] + dxd_dy * dy_dp[i]);
        dq_dp[(1, i)] = fy * (dyd_dx * dx_dp[i] + dyd_dy * dy_dp[i]);
    }

    let mut nocore = [[0.0; MAX_DISTORTION_PARAMS]; 2];
    let mut put = |j: usize, gx: f64, gy: f64| {
        if j < n_dist {
            nocore[0][j] = fx * gx;
            nocore[1][j] = fy * gy;
        }
    };
    put(0, x * r2 * den_recip, y * r2 * den_recip); // k1
    put(1, x * r4 * den_recip, y * r4 * den_recip); // k2
    put(2, a1, a3); // p1
    put(3, a2, a1); // p2
    put(4, x * r6 * den_recip, y * r6 * den_recip); // k3
    put(5, -x * radial * r2 * den_recip, -y * radial * r2 * den_recip); // k4
    put(6, -x * radial * r4 * den_recip, -y * radial * r4 * den_recip); // k5
    put(7, -x * radial * r6 * den_recip, -y * radial * r6 * den_recip); // k6
    put(8, r2, 0.0); // s1
    put(9, r4, 0.0); // s2
    put(10, 0.0, r2); // s3
    put(11, 0.0, r4); // s4

    Projection { q, dq_dp, dq_dfxy: [xd, yd], nocore }
}
