#![allow(dead_code)]

use nalgebra::Vector3;

use cal_adjust::{
    BoardObservation, CalibrationData, CornerObservation, LensModel, ProblemDetails,
};
use lens_geom::project::{project_point, GradientRequest};
use lens_geom::{JointTransform, Pose};

pub const W: usize = 10;
pub const SPACING: f64 = 1.0;

pub fn core_intrinsics(cam: usize) -> [f64; 4] {
    [
        [2000.3, 1900.5, 1800.3, 1790.2],
        [2100.2, 2130.4, 1830.3, 1810.2],
    ][cam]
}

/// Seed intrinsics for one camera: the scenario core plus small non-zero
/// distortions (zero seeds would sit on the regularization kink).
pub fn intrinsics_for(model: &LensModel, cam: usize) -> Vec<f64> {
    if let LensModel::SplinedStereographic(config) = model {
        return (0..config.n_params())
            .map(|i| 1400.0 + 3.0 * ((i + 5 * cam) % 17) as f64)
            .collect();
    }

    let mut intrinsics = core_intrinsics(cam).to_vec();
    match model {
        LensModel::Pinhole => {}
        LensModel::Cahvor => {
            intrinsics.extend([0.01, -0.02, 0.002, -0.0005, 0.0002]);
        }
        m if m.is_opencv() => {
            for j in 0..m.n_distortion_params() {
                let sign = if j % 2 == 0 { 1.0 } else { -1.0 };
                intrinsics.push(sign * 0.002 * (1.0 + 0.3 * j as f64 + 0.5 * cam as f64));
            }
        }
        _ => unreachable!(),
    }
    intrinsics
}

pub fn frame_pose() -> Pose {
    Pose::new(Vector3::new(-0.1, 0.52, -0.13), Vector3::new(1.3, 0.1, 10.2))
}

pub fn camera1_pose() -> Pose {
    Pose::new(Vector3::new(0.02, -0.01, 0.03), Vector3::new(-2.0, 0.1, 0.3))
}

/// The literal observed pixels of the end-to-end scenarios:
/// q_ij = (1000 + j - 10 i, 1000 - j + 30 i), i the row.
pub fn ramp_corners() -> Vec<CornerObservation> {
    let mut corners = Vec::with_capacity(W * W);
    for i in 0..W {
        for j in 0..W {
            corners.push(CornerObservation {
                x: 1000.0 + j as f64 - 10.0 * i as f64,
                y: 1000.0 - j as f64 + 30.0 * i as f64,
                weight: 1.0,
            });
        }
    }
    corners
}

/// The two-camera scenario-1 problem with the synthetic pixel ramp.
pub fn scenario_data(
    model: &LensModel,
    details: ProblemDetails,
    cameras_with_observations: usize,
) -> CalibrationData {
    let mut intrinsics = intrinsics_for(model, 0);
    intrinsics.extend(intrinsics_for(model, 1));

    CalibrationData {
        model: *model,
        details,
        intrinsics,
        extrinsics: vec![camera1_pose()],
        frames: vec![frame_pose()],
        points: vec![],
        calobject_warp: Some([0.001, -0.0005]),
        observations_board: (0..cameras_with_observations)
            .map(|c| BoardObservation {
                i_camera: c,
                i_frame: 0,
                corners: ramp_corners(),
                skip: false,
            })
            .collect(),
        observations_point: vec![],
        imagersizes: vec![[3600, 3000]; 2],
        roi: None,
        object_spacing: SPACING,
        object_width_n: W,
    }
}

/// Project the calibration object through the given poses and intrinsics.
pub fn projected_corners(
    model: &LensModel,
    intrinsics: &[f64],
    camera_rt: Option<&Pose>,
    frame_rt: &Pose,
) -> Vec<CornerObservation> {
    let xf = JointTransform::new(camera_rt, frame_rt);
    let mut corners = Vec::with_capacity(W * W);
    for iy in 0..W {
        for ix in 0..W {
            let p_ref = Vector3::new(ix as f64 * SPACING, iy as f64 * SPACING, 0.0);
            let c = project_point(
                model,
                intrinsics,
                &xf,
                &p_ref,
                None,
                GradientRequest::default(),
            )
            .unwrap();
            corners.push(CornerObservation { x: c.q[0], y: c.q[1], weight: 1.0 });
        }
    }
    corners
}

/// A consistent multi-frame problem: the observations are exact projections
/// of the seed parameters, so the seed is already the optimum.
pub fn generated_data(model: &LensModel, details: ProblemDetails, nframes: usize) -> CalibrationData {
    let mut intrinsics = intrinsics_for(model, 0);
    intrinsics.extend(intrinsics_for(model, 1));

    let frames: Vec<Pose> = (0..nframes)
        .map(|k| {
            let k = k as f64;
            Pose::new(
                Vector3::new(-0.1 + 0.07 * k, 0.52 - 0.05 * k, -0.13 + 0.03 * k),
                Vector3::new(1.3 - 0.5 * k, 0.1 + 0.4 * k, 10.2 + 0.8 * k),
            )
        })
        .collect();

    let mut observations_board = Vec::new();
    for (i_frame, frame) in frames.iter().enumerate() {
        for i_camera in 0..2usize {
            let camera_rt = (i_camera == 1).then(camera1_pose);
            let corners = projected_corners(
                model,
                &intrinsics[i_camera * model.n_lens_params()..][..model.n_lens_params()],
                camera_rt.as_ref(),
                frame,
            );
            observations_board.push(BoardObservation { i_camera, i_frame, corners, skip: false });
        }
    }

    CalibrationData {
        model: *model,
        details,
        intrinsics,
        extrinsics: vec![camera1_pose()],
        frames,
        points: vec![],
        calobject_warp: None,
        observations_board,
        observations_point: vec![],
        imagersizes: vec![[3600, 3000]; 2],
        roi: None,
        object_spacing: SPACING,
        object_width_n: W,
    }
}
