//! CAHVORE forward projection.
//!
//! Ported from the JPL cmod_cahvore_3d_to_2d_general() lineage. The input
//! vector is normalized before the Newton solve so that project(v) and
//! project(k v) land on the same pixel. No gradients are available.

use nalgebra::Vector3;

use crate::error::{Error, Result};

pub(crate) fn project(intrinsics: &[f64], v: &Vector3<f64>) -> Result<[f64; 2]> {
    let (fx, fy, cx, cy) = (intrinsics[0], intrinsics[1], intrinsics[2], intrinsics[3]);
    let alpha = intrinsics[4];
    let beta = intrinsics[4 + 1];
    let r0 = intrinsics[4 + 2];
    let r1 = intrinsics[4 + 3];
    let r2 = intrinsics[4 + 4];
    let e0 = intrinsics[4 + 5];
    let e1 = intrinsics[4 + 6];
    let e2 = intrinsics[4 + 7];
    let linearity = intrinsics[4 + 8];

    let (sa, ca) = alpha.sin_cos();
    let (sb, cb) = beta.sin_cos();
    let o = Vector3::new(cb * sa, sb, cb * ca);

    let v_unit = v / v.norm();

    let omega = v_unit.dot(&o);
    let ll = v_unit - o * omega;
    let l = ll.norm();

    // theta via Newton's method
    let mut theta = l.atan2(omega);
    let mut converged = false;
    for _ in 0..100 {
        let (sth, cth) = theta.sin_cos();
        let theta2 = theta * theta;
        let theta3 = theta * theta2;
        let theta4 = theta * theta3;
        let upsilon = omega * cth + l * sth
            - (1.0 - cth) * (e0 + e1 * theta2 + e2 * theta4)
            - (theta - sth) * (2.0 * e1 * theta + 4.0 * e2 * theta3);
        let dtheta =
            (omega * sth - l * cth - (theta - sth) * (e0 + e1 * theta2 + e2 * theta4)) / upsilon;
        theta -= dtheta;
        if dtheta.abs() < 1e-8 {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(Error::ProjectionFailed("CAHVORE: too many Newton iterations"));
    }
    if theta * linearity.abs() > std::f64::consts::FRAC_PI_2 {
        return Err(Error::ProjectionFailed("CAHVORE: theta out of bounds"));
    }

    // small angles project through the pinhole core directly
    if theta <= 1e-8 {
        return Ok([
            fx * v_unit.x / v_unit.z + cx,
            fy * v_unit.y / v_unit.z + cy,
        ]);
    }

    let linth = linearity * theta;
    let chi = if linearity < -1e-15 {
        linth.sin() / linearity
    } else if linearity > 1e-15 {
        linth.tan() / linearity
    } else {
        theta
    };

    let chi2 = chi * chi;
    let chi4 = chi2 * chi2;
    let zetap = l / chi;
    let mu = r0 + r1 * chi2 + r2 * chi4;

    let warped = o * zetap + ll * (1.0 + mu);
    Ok([fx * warped.x / warped.z + cx, fy * warped.y / warped.z + cy])
}
