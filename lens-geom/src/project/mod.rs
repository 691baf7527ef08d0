//! The projection kernel.
//!
//! Maps one reference-frame 3D point through the joint pose and a lens model
//! into pixel coordinates, producing the analytic partials with respect to
//! the intrinsics, the camera pose, the frame pose, and the object warp.
//!
//! Each lens family computes `(q, dq/dp_cam, intrinsics gradients)` in camera
//! coordinates; the shared chain rule here composes the pose partials from
//! [crate::rotation::JointTransform] onto `dq/dp_cam`.

mod cahvor;
mod cahvore;
mod opencv;
mod splined;

pub use splined::SplinedRun;

pub(crate) use cahvore::project as project_cahvore;

use nalgebra::{Matrix2, Matrix2x3, Vector3};

use crate::error::{Error, Result};
use crate::models::LensModel;
use crate::rotation::{JointTransform, Pose, TransformedPoint};

/// The largest distortion-parameter count of any parametric model (OPENCV12).
pub const MAX_DISTORTION_PARAMS: usize = 12;

/// Which gradients the caller wants computed.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientRequest {
    pub intrinsics: bool,
    pub camera: bool,
    pub frame: bool,
    pub warp: bool,
}

impl GradientRequest {
    pub fn all() -> Self {
        GradientRequest { intrinsics: true, camera: true, frame: true, warp: true }
    }
}

/// Intrinsics gradients of one projected point.
///
/// Parametric models are dense across their whole (small) parameter vector.
/// The splined model touches only a 4x4 tile of control points; the tile is
/// described by its first variable index and the separable sample
/// coefficients, and stays sparse until someone densifies it.
#[derive(Debug, Clone)]
pub enum IntrinsicGradients {
    Parametric {
        /// dqx/dfx and dqy/dfy. The off-diagonal terms are zero, and
        /// dq/d(cx,cy) is the identity.
        dq_dfxy: [f64; 2],
        /// (2, n_dist) gradients for the non-core parameters.
        nocore: [[f64; MAX_DISTORTION_PARAMS]; 2],
        n_dist: usize,
    },
    Splined(SplinedRun),
}

/// One projected point and its gradients. Fields are `None` when the
/// corresponding gradient was not requested (or does not exist, as with the
/// camera pose of camera 0).
#[derive(Debug, Clone)]
pub struct CornerProjection {
    pub q: [f64; 2],
    pub intrinsics: Option<IntrinsicGradients>,
    pub dq_drcamera: Option<Matrix2x3<f64>>,
    pub dq_dtcamera: Option<Matrix2x3<f64>>,
    pub dq_drframe: Option<Matrix2x3<f64>>,
    pub dq_dtframe: Option<Matrix2x3<f64>>,
    pub dq_dwarp: Option<Matrix2<f64>>,
}

fn project_pinhole(intrinsics: &[f64], p: &Vector3<f64>) -> ([f64; 2], Matrix2x3<f64>, [f64; 2]) {
    let (fx, fy, cx, cy) = (intrinsics[0], intrinsics[1], intrinsics[2], intrinsics[3]);
    let pz_recip = 1.0 / p.z;
    let q = [p.x * pz_recip * fx + cx, p.y * pz_recip * fy + cy];
    let dq_dp = Matrix2x3::new(
        fx * pz_recip,
        0.0,
        -fx * p.x * pz_recip * pz_recip,
        0.0,
        fy * pz_recip,
        -fy * p.y * pz_recip * pz_recip,
    );
    (q, dq_dp, [p.x * pz_recip, p.y * pz_recip])
}

/// Model dispatch: projection in camera coordinates.
fn model_projection(
    model: &LensModel,
    intrinsics: &[f64],
    p: &Vector3<f64>,
) -> Result<([f64; 2], Matrix2x3<f64>, IntrinsicGradients)> {
    match model {
        LensModel::Pinhole => {
            let (q, dq_dp, dq_dfxy) = project_pinhole(intrinsics, p);
            Ok((
                q,
                dq_dp,
                IntrinsicGradients::Parametric {
                    dq_dfxy,
                    nocore: [[0.0; MAX_DISTORTION_PARAMS]; 2],
                    n_dist: 0,
                },
            ))
        }
        LensModel::OpenCv4 | LensModel::OpenCv5 | LensModel::OpenCv8 | LensModel::OpenCv12 => {
            let r = opencv::project(intrinsics, model.n_distortion_params(), p);
            Ok((
                r.q,
                r.dq_dp,
                IntrinsicGradients::Parametric {
                    dq_dfxy: r.dq_dfxy,
                    nocore: r.nocore,
                    n_dist: model.n_distortion_params(),
                },
            ))
        }
        LensModel::Cahvor => {
            let r = cahvor::project(intrinsics, p);
            Ok((
                r.q,
                r.dq_dp,
                IntrinsicGradients::Parametric {
                    dq_dfxy: r.dq_dfxy,
                    nocore: r.nocore,
                    n_dist: 5,
                },
            ))
        }
        LensModel::Cahvore => Err(Error::UnsupportedOperation(
            "CAHVORE is supported for plain projection only, without gradients",
        )),
        LensModel::SplinedStereographic(config) => {
            let r = splined::project(config, intrinsics, p);
            Ok((r.q, r.dq_dp, IntrinsicGradients::Splined(r.run)))
        }
    }
}

fn compose(
    model: &LensModel,
    intrinsics: &[f64],
    tp: &TransformedPoint,
    warp_chain: Option<(Vector3<f64>, [f64; 2])>,
    want: GradientRequest,
) -> Result<CornerProjection> {
    let (q, dq_dp, intrinsic_grads) = model_projection(model, intrinsics, &tp.p)?;

    let dq_drcamera = match (want.camera, &tp.dp_drcamera) {
        (true, Some(dp)) => Some(dq_dp * dp),
        _ => None,
    };
    let dq_dtcamera = match (want.camera, &tp.dp_dtcamera) {
        (true, Some(dp)) => Some(dq_dp * dp),
        _ => None,
    };
    let dq_drframe = want.frame.then(|| dq_dp * tp.dp_drframe);
    let dq_dtframe = want.frame.then(|| dq_dp * tp.dp_dtframe);

    // Only z of the reference point depends on the warp:
    //   dq/dk = dq/dp_cam . R_joint[:,2] . dz/dk
    let dq_dwarp = match (want.warp, warp_chain) {
        (true, Some((rz, dz_dwarp))) => {
            let dq_dz = dq_dp * rz;
            Some(Matrix2::new(
                dq_dz.x * dz_dwarp[0],
                dq_dz.x * dz_dwarp[1],
                dq_dz.y * dz_dwarp[0],
                dq_dz.y * dz_dwarp[1],
            ))
        }
        _ => None,
    };

    Ok(CornerProjection {
        q,
        intrinsics: want.intrinsics.then_some(intrinsic_grads),
        dq_drcamera,
        dq_dtcamera,
        dq_drframe,
        dq_dtframe,
        dq_dwarp,
    })
}

/// Project one calibration-object point.
///
/// `p_ref` is in the calibration object's coordinates (warp displacement
/// already applied); `dz_dwarp` is the displacement's gradient, present for
/// board points when the warp gradient is wanted.
pub fn project_point(
    model: &LensModel,
    intrinsics: &[f64],
    xf: &JointTransform,
    p_ref: &Vector3<f64>,
    dz_dwarp: Option<[f64; 2]>,
    want: GradientRequest,
) -> Result<CornerProjection> {
    let tp = xf.transform(p_ref);
    let warp_chain = dz_dwarp.map(|dz| (xf.joint_rotation_z(), dz));
    compose(model, intrinsics, &tp, warp_chain, want)
}

/// Project an isolated point given directly in reference coordinates.
///
/// There is no frame rotation and no warp; `dq_dtframe` of the result is the
/// partial with respect to the point's position.
pub fn project_position(
    model: &LensModel,
    intrinsics: &[f64],
    camera_rt: Option<&Pose>,
    position: &Vector3<f64>,
    want: GradientRequest,
) -> Result<CornerProjection> {
    let xf = JointTransform::new(camera_rt, &Pose::default());
    let tp = xf.transform_position(position);
    compose(model, intrinsics, &tp, None, want)
}
