//! Analytic-vs-numeric Jacobian checks over every lens family and
//! optimize-flag combination, at the literal scenario-1 seed state.

mod common;

use approx::assert_relative_eq;
use levenberg_marquardt::{differentiate_numerically, LeastSquaresProblem};
use nalgebra::Vector3;

use cal_adjust::{CalibrationProblem, LensModel, PointObservation, ProblemDetails};

fn flag_combinations() -> Vec<ProblemDetails> {
    let core_only = ProblemDetails {
        do_optimize_intrinsic_core: true,
        do_optimize_extrinsics: true,
        do_optimize_frames: true,
        ..Default::default()
    };
    let poses_only = ProblemDetails {
        do_optimize_extrinsics: true,
        do_optimize_frames: true,
        ..Default::default()
    };
    let distortions_only = ProblemDetails {
        do_optimize_intrinsic_distortions: true,
        do_optimize_frames: true,
        ..Default::default()
    };
    let with_warp = ProblemDetails {
        do_optimize_extrinsics: true,
        do_optimize_frames: true,
        do_optimize_calobject_warp: true,
        ..Default::default()
    };
    vec![core_only, poses_only, distortions_only, with_warp, ProblemDetails::all()]
}

fn models_under_test() -> Vec<LensModel> {
    vec![
        LensModel::Pinhole,
        LensModel::OpenCv4,
        LensModel::OpenCv8,
        LensModel::OpenCv12,
        LensModel::Cahvor,
        "SPLINED_STEREOGRAPHIC_3_8_6_120.0_960.0_540.0".parse().unwrap(),
    ]
}

#[test]
fn analytic_jacobian_matches_finite_differences() {
    for model in models_under_test() {
        for details in flag_combinations() {
            let mut data = common::scenario_data(&model, details, 2);
            // cover the point rows and the range row too
            data.points = vec![Vector3::new(1.1, -0.8, 18.0)];
            data.observations_point = vec![PointObservation {
                i_camera: 1,
                i_point: 0,
                x: 1100.0,
                y: 800.0,
                weight: 1.0,
                dist: Some(18.0),
                skip: false,
            }];

            let problem = CalibrationProblem::new(data).unwrap();
            let jacobian_analytic = problem.jacobian().unwrap();

            let mut fd_problem = problem.clone();
            let jacobian_numeric = differentiate_numerically(&mut fd_problem).unwrap();

            assert_relative_eq!(
                jacobian_numeric,
                jacobian_analytic,
                epsilon = 1e-6,
                max_relative = 1e-5
            );
        }
    }
}

#[test]
fn scenario_1_gradient_check_and_residual_count() {
    // two cameras, pinhole, intrinsic core only, one board observation of a
    // 10x10 grid: 10*10*2 residuals plus the regularization rows
    let details = ProblemDetails {
        do_optimize_intrinsic_core: true,
        do_optimize_extrinsics: true,
        do_optimize_frames: true,
        ..Default::default()
    };
    let data = common::scenario_data(&LensModel::Pinhole, details, 1);
    let problem = CalibrationProblem::new(data).unwrap();

    let n_regularization = 2 * 2; // cx, cy per camera
    assert_eq!(problem.n_measurements(), 10 * 10 * 2 + n_regularization);

    let jacobian_analytic = problem.jacobian().unwrap();
    let mut fd_problem = problem.clone();
    let jacobian_numeric = differentiate_numerically(&mut fd_problem).unwrap();
    assert_relative_eq!(
        jacobian_numeric,
        jacobian_analytic,
        epsilon = 1e-6,
        max_relative = 1e-5
    );
}
