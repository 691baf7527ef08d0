//! CAHVOR projection with analytic gradients.
//!
//! The model perturbs the camera-frame point radially about an optical axis
//! parameterized by (alpha, beta), then projects through the pinhole core.
//! The axis is parameterized so that o(0, 0) = (0, 0, 1) and the gradients
//! stay cartesian at the center; the poles would gimbal-lock the solver.

use nalgebra::{Matrix2x3, Matrix3, Vector3};

use super::MAX_DISTORTION_PARAMS;

pub(super) struct Projection {
    pub q: [f64; 2],
    pub dq_dp: Matrix2x3<f64>,
    pub dq_dfxy: [f64; 2],
    pub nocore: [[f64; MAX_DISTORTION_PARAMS]; 2],
}

pub(super) fn project(intrinsics: &[f64], p: &Vector3<f64>) -> Projection {
    // distortion layout: alpha, beta, r0, r1, r2
    let alpha = intrinsics[4];
    let beta = intrinsics[4 + 1];
    let r0 = intrinsics[4 + 2];
    let r1 = intrinsics[4 + 3];
    let r2 = intrinsics[4 + 4];

    let (s_al, c_al) = alpha.sin_cos();
    let (s_be, c_be) = beta.sin_cos();

    let o = Vector3::new(s_al * c_be, s_be, c_al * c_be);
    let do_dalpha = Vector3::new(c_al * c_be, 0.0, -s_al * c_be);
    let do_dbeta = Vector3::new(-s_al * s_be, c_be, -c_al * s_be);

    let norm2p = p.norm_squared();
    let omega = p.dot(&o);
    let domega_dalpha = p.dot(&do_dalpha);
    let domega_dbeta = p.dot(&do_dbeta);

    let omega_recip = 1.0 / omega;
    let tau = norm2p * omega_recip * omega_recip - 1.0;
    let dtau_domega = -2.0 * norm2p * omega_recip * omega_recip * omega_recip;
    let dmu_dtau = r1 + 2.0 * tau * r2;
    let mu = r0 + tau * (r1 + tau * r2);
    let dmu_domega = dmu_dtau * dtau_domega;

    let mut dmu_dp = Vector3::zeros();
    for i in 0..3 {
        dmu_dp[i] = dmu_dtau * (2.0 * p[i] * omega_recip * omega_recip + dtau_domega * o[i]);
    }

    let dmu_ddist = [
        dmu_domega * domega_dalpha,
        dmu_domega * domega_dbeta,
        1.0,
        tau,
        tau * tau,
    ];

    let mut p_distorted = Vector3::zeros();
    let mut dpdist_dp = Matrix3::zeros();
    let mut dpdist_ddist = [[0.0; 5]; 3];
    for i in 0..3 {
        for j in 0..5 {
            dpdist_ddist[i][j] = p[i] * dmu_ddist[j] - dmu_ddist[j] * omega * o[i];
        }
        dpdist_ddist[i][0] -= mu * (domega_dalpha * o[i] + omega * do_dalpha[i]);
        dpdist_ddist[i][1] -= mu * (domega_dbeta * o[i] + omega * do_dbeta[i]);

        dpdist_dp[(i, i)] = mu + 1.0;
        for j in 0..3 {
            dpdist_dp[(i, j)] += (p[i] - omega * o[i]) * dmu_dp[j] - mu * o[i] * o[j];
        }

        p_distorted[i] = p[i] + mu * (p[i] - omega * o[i]);
    }

    // pinhole projection of the distorted point
    let (fx, fy, cx, cy) = (intrinsics[0], intrinsics[1], intrinsics[2], intrinsics[3]);
    let pz_recip = 1.0 / p_distorted.z;
    let q = [
        p_distorted.x * pz_recip * fx + cx,
        p_distorted.y * pz_recip * fy + cy,
    ];

    let dq_dpdist = Matrix2x3::new(
        fx * pz_recip,
        0.0,
        -fx * p_distorted.x * pz_recip * pz_recip,
        0.0,
        fy * pz_recip,
        -fy * p_distorted.y * pz_recip * pz_recip,
    );
    let dq_dp = dq_dpdist * dpdist_dp;

    let mut nocore = [[0.0; MAX_DISTORTION_PARAMS]; 2];
    for j in 0..5 {
        let dx = dpdist_ddist[0][j];
        let dy = dpdist_ddist[1][j];
        let dz = dpdist_ddist[2][j];
        nocore[0][j] = fx * pz_recip * (dx - p_distorted.x * pz_recip * dz);
        nocore[1][j] = fy * pz_recip * (dy - p_distorted.y * pz_recip * dz);
    }

    Projection {
        q,
        dq_dp,
        dq_dfxy: [p_distorted.x * pz_recip, p_distorted.y * pz_recip],
        nocore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const INTRINSICS: [f64; 9] = [
        2000.3, 1900.5, 1800.3, 1790.2, // core
        0.01, -0.02, 0.002, -0.0005, 0.0002, // alpha beta r0 r1 r2
    ];

    #[test]
    fn gradients_match_numeric() {
        let p = Vector3::new(0.9, -1.4, 11.0);
        let got = project(&INTRINSICS, &p);
        let h = 1e-6;

        for i in 0..3 {
            let mut pp = p;
            let mut pm = p;
            pp[i] += h;
            pm[i] -= h;
            let qp = project(&INTRINSICS, &pp).q;
            let qm = project(&INTRINSICS, &pm).q;
            for i_xy in 0..2 {
                assert_relative_eq!(
                    got.dq_dp[(i_xy, i)],
                    (qp[i_xy] - qm[i_xy]) / (2.0 * h),
                    max_relative = 1e-5,
                    epsilon = 1e-7
                );
            }
        }

        for j in 0..5 {
            let mut ip = INTRINSICS;
            let mut im = INTRINSICS;
            ip[4 + j] += h;
            im[4 + j] -= h;
            let qp = project(&ip, &p).q;
            let qm = project(&im, &p).q;
            for i_xy in 0..2 {
                assert_relative_eq!(
                    got.nocore[i_xy][j],
                    (qp[i_xy] - qm[i_xy]) / (2.0 * h),
                    max_relative = 1e-5,
                    epsilon = 1e-7
                );
            }
        }
    }

    #[test]
    fn zero_distortion_is_pinhole() {
        let intrinsics = [2000.3, 1900.5, 1800.3, 1790.2, 0.0, 0.0, 0.0, 0.0, 0.0];
        let p = Vector3::new(1.1, 2.2, 9.5);
        let got = project(&intrinsics, &p);
        assert_relative_eq!(got.q[0], 1.1 / 9.5 * 2000.3 + 1800.3, epsilon = 1e-9);
        assert_relative_eq!(got.q[1], 2.2 / 9.5 * 1900.5 + 1790.2, epsilon = 1e-9);
    }
}
