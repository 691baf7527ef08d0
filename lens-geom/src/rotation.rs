use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// A rigid transform: a Rodrigues axis-angle rotation followed by a
/// translation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub r: Vector3<f64>,
    pub t: Vector3<f64>,
}

impl Pose {
    pub fn new(r: Vector3<f64>, t: Vector3<f64>) -> Self {
        Pose { r, t }
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        rodrigues(&self.r)
    }
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

// Below this the trig expressions lose precision and the series expansions
// take over.
const SMALL_ANGLE_SQ: f64 = 1e-14;

/// Rotation matrix for the Rodrigues vector `r`.
pub fn rodrigues(r: &Vector3<f64>) -> Matrix3<f64> {
    let theta_sq = r.norm_squared();
    let rx = skew(r);
    if theta_sq < SMALL_ANGLE_SQ {
        return Matrix3::identity() + rx + rx * rx * 0.5;
    }
    let theta = theta_sq.sqrt();
    let (sin, cos) = theta.sin_cos();
    Matrix3::identity() + rx * (sin / theta) + rx * rx * ((1.0 - cos) / theta_sq)
}

/// Right Jacobian of SO(3) at `r`: Exp(r + d) = Exp(r) Exp(Jr(r) d) to first
/// order.
fn right_jacobian(r: &Vector3<f64>) -> Matrix3<f64> {
    let theta_sq = r.norm_squared();
    let rx = skew(r);
    if theta_sq < SMALL_ANGLE_SQ {
        return Matrix3::identity() - rx * 0.5 + rx * rx * (1.0 / 6.0);
    }
    let theta = theta_sq.sqrt();
    let (sin, cos) = theta.sin_cos();
    Matrix3::identity() - rx * ((1.0 - cos) / theta_sq)
        + rx * rx * ((theta - sin) / (theta_sq * theta))
}

/// Rotate `p` by the Rodrigues vector `r`.
///
/// Returns `(R p, d(R p)/dr, R)`.
pub fn rotate_point(
    r: &Vector3<f64>,
    p: &Vector3<f64>,
) -> (Vector3<f64>, Matrix3<f64>, Matrix3<f64>) {
    let rot = rodrigues(r);
    let rotated = rot * p;
    let d_rotated_dr = -rot * skew(p) * right_jacobian(r);
    (rotated, d_rotated_dr, rot)
}

/// A point mapped into the observing camera's coordinates, together with its
/// partials with respect to the poses that produced it.
///
/// The camera-pose partials are absent when the camera sits at the reference
/// (camera 0); its pose is pinned to the identity and owns no state.
#[derive(Debug, Clone)]
pub struct TransformedPoint {
    pub p: Vector3<f64>,
    pub dp_drcamera: Option<Matrix3<f64>>,
    pub dp_dtcamera: Option<Matrix3<f64>>,
    pub dp_drframe: Matrix3<f64>,
    pub dp_dtframe: Matrix3<f64>,
}

/// The composition of the frame transform (calibration object to reference)
/// with the camera transform (reference to camera), precomputed once per
/// observation.
#[derive(Debug, Clone)]
pub struct JointTransform {
    camera: Option<Pose>,
    frame: Pose,
    rot_camera: Matrix3<f64>,
    rot_frame: Matrix3<f64>,
    jr_camera: Matrix3<f64>,
    jr_frame: Matrix3<f64>,
    rot_joint: Matrix3<f64>,
}

impl JointTransform {
    /// `camera_rt == None` places the camera at the reference.
    pub fn new(camera_rt: Option<&Pose>, frame_rt: &Pose) -> JointTransform {
        let rot_frame = rodrigues(&frame_rt.r);
        let jr_frame = right_jacobian(&frame_rt.r);
        let (rot_camera, jr_camera) = match camera_rt {
            Some(camera) => (rodrigues(&camera.r), right_jacobian(&camera.r)),
            None => (Matrix3::identity(), Matrix3::identity()),
        };
        JointTransform {
            camera: camera_rt.copied(),
            frame: *frame_rt,
            rot_joint: rot_camera * rot_frame,
            rot_camera,
            rot_frame,
            jr_camera,
            jr_frame,
        }
    }

    /// Third column of the joint rotation. The object warp displaces the
    /// reference point along the object's z axis, so this is the direction
    /// that displacement takes in camera coordinates.
    pub fn joint_rotation_z(&self) -> Vector3<f64> {
        self.rot_joint.column(2).into_owned()
    }

    /// Map a calibration-object point into camera coordinates with all the
    /// pose partials.
    pub fn transform(&self, p_ref: &Vector3<f64>) -> TransformedPoint {
        let p0 = self.rot_frame * p_ref + self.frame.t;
        let dp0_drframe = -self.rot_frame * skew(p_ref) * self.jr_frame;

        match &self.camera {
            Some(camera) => {
                let p = self.rot_camera * p0 + camera.t;
                let dp_drcamera = -self.rot_camera * skew(&p0) * self.jr_camera;
                TransformedPoint {
                    p,
                    dp_drcamera: Some(dp_drcamera),
                    dp_dtcamera: Some(Matrix3::identity()),
                    dp_drframe: self.rot_camera * dp0_drframe,
                    dp_dtframe: self.rot_camera,
                }
            }
            None => TransformedPoint {
                p: p0,
                dp_drcamera: None,
                dp_dtcamera: None,
                dp_drframe: dp0_drframe,
                dp_dtframe: Matrix3::identity(),
            },
        }
    }

    /// Map an isolated point (given directly in reference coordinates) into
    /// camera coordinates. There is no frame rotation; `dp_dtframe` is the
    /// partial with respect to the point's position.
    pub fn transform_position(&self, p_ref: &Vector3<f64>) -> TransformedPoint {
        match &self.camera {
            Some(camera) => {
                let p = self.rot_camera * p_ref + camera.t;
                let dp_drcamera = -self.rot_camera * skew(p_ref) * self.jr_camera;
                TransformedPoint {
                    p,
                    dp_drcamera: Some(dp_drcamera),
                    dp_dtcamera: Some(Matrix3::identity()),
                    dp_drframe: Matrix3::zeros(),
                    dp_dtframe: self.rot_camera,
                }
            }
            None => TransformedPoint {
                p: *p_ref,
                dp_drcamera: None,
                dp_dtcamera: None,
                dp_drframe: Matrix3::zeros(),
                dp_dtframe: Matrix3::identity(),
            },
        }
    }
}
