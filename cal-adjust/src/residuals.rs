//! The residual/Jacobian assembler.
//!
//! Residual order, identical on every call:
//!
//! 1. board observations, corners in row-major order, x then y per corner;
//! 2. point observations, x then y, then the range residual when a
//!    reference distance is given;
//! 3. regularization, per camera: one row per distortion value, then the
//!    cx/cy center-offset rows.
//!
//! Jacobian entries land in packed-state column order. Skipped observations
//! keep their rows (zero residual) and write rank-preserving filler into the
//! frame/point block; outlier-marked corners keep their rows with zeros
//! everywhere. Either way the entry count matches
//! [crate::jacobian::n_jacobian_nonzero] exactly.

use nalgebra::{Matrix2x3, Vector3};

use lens_geom::project::{
    project_point, project_position, GradientRequest, IntrinsicGradients, SplinedRun,
};
use lens_geom::{rotate_point, JointTransform, LensModel, Pose};

use crate::error::Result;
use crate::jacobian::JacobianWriter;
use crate::observations::{
    board_point, roi_weight, BoardObservation, PointObservation, RegionOfInterest,
};
use crate::state::{
    Layout, DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M, POINT_MAXZ, SCALE_CALOBJECT_WARP,
    SCALE_DISTORTION, SCALE_INTRINSICS_CENTER_PIXEL, SCALE_INTRINSICS_FOCAL_LENGTH,
    SCALE_POSITION_POINT, SCALE_ROTATION_CAMERA, SCALE_ROTATION_FRAME, SCALE_TRANSLATION_CAMERA,
    SCALE_TRANSLATION_FRAME,
};

// Arbitrary unequal values written into the frame/point block of skipped
// rows. They keep the Hessian full-rank when a frame or point has no live
// observations left; the residual is 0 so they never move the solution.
const RANK_FILLER: [f64; 6] = [1.1, 1.2, 1.3, 1.4, 1.5, 1.6];

pub(crate) struct Assembly<'a> {
    pub layout: Layout,
    pub intrinsics: &'a [f64],
    pub extrinsics: &'a [Pose],
    pub frames: &'a [Pose],
    pub points: &'a [Vector3<f64>],
    pub calobject_warp: Option<[f64; 2]>,
    pub observations_board: &'a [BoardObservation],
    pub observations_point: &'a [PointObservation],
    pub roi: Option<&'a [RegionOfInterest]>,
    pub imagersizes: &'a [[u32; 2]],
    pub object_spacing: f64,
    pub object_width_n: usize,
    pub outliers: &'a [bool],
    pub n_measurements: usize,
}

impl Assembly<'_> {
    fn camera_intrinsics(&self, i_camera: usize) -> &[f64] {
        let n = self.layout.model.n_lens_params();
        &self.intrinsics[i_camera * n..][..n]
    }

    fn splined_nx(&self) -> Option<u16> {
        match self.layout.model {
            LensModel::SplinedStereographic(config) => Some(config.nx),
            _ => None,
        }
    }
}

fn emit_pose3<W: JacobianWriter>(
    jac: &mut W,
    col0: usize,
    d: &Matrix2x3<f64>,
    i_xy: usize,
    scale: f64,
) {
    jac.put3(
        col0,
        d[(i_xy, 0)] * scale,
        d[(i_xy, 1)] * scale,
        d[(i_xy, 2)] * scale,
    );
}

/// One residual row's intrinsics entries. `payload == None` writes the same
/// column pattern with zeros (skipped/outlier rows).
fn emit_intrinsics_row<W: JacobianWriter>(
    jac: &mut W,
    layout: &Layout,
    splined_nx: Option<u16>,
    i_var_intrinsics: usize,
    i_xy: usize,
    payload: Option<(&IntrinsicGradients, f64)>,
) {
    let details = &layout.details;
    let has_core = layout.model.has_core();
    let core = details.do_optimize_intrinsic_core && has_core;
    let n_core_state = if core { 4 } else { 0 };

    if core {
        let (dq_dfxy_i, weight) = match payload {
            Some((IntrinsicGradients::Parametric { dq_dfxy, .. }, weight)) => {
                (dq_dfxy[i_xy], weight)
            }
            Some((IntrinsicGradients::Splined(_), _)) | None => (0.0, 0.0),
        };
        // fx, fy: x depends on fx only, y on fy only
        jac.put(
            i_var_intrinsics + i_xy,
            dq_dfxy_i * weight * SCALE_INTRINSICS_FOCAL_LENGTH,
        );
        // cx, cy: the gradient is exactly 1
        jac.put(
            i_var_intrinsics + i_xy + 2,
            weight * SCALE_INTRINSICS_CENTER_PIXEL,
        );
    }

    if details.do_optimize_intrinsic_distortions {
        match payload {
            Some((IntrinsicGradients::Parametric { nocore, n_dist, .. }, weight)) => {
                for j in 0..*n_dist {
                    jac.put(
                        i_var_intrinsics + n_core_state + j,
                        nocore[i_xy][j] * weight * SCALE_DISTORTION,
                    );
                }
            }
            Some((IntrinsicGradients::Splined(run), weight)) => {
                let stride = SplinedRun::stride(splined_nx.unwrap());
                for ty in 0..SplinedRun::SIDE {
                    for tx in 0..SplinedRun::SIDE {
                        jac.put(
                            i_var_intrinsics + run.ivar0 + ty * stride + 2 * tx + i_xy,
                            run.coefficient(tx, ty, i_xy) * weight * SCALE_DISTORTION,
                        );
                    }
                }
            }
            None => match splined_nx {
                Some(nx) => {
                    // no projection ran, so no natural tile; zeros go into
                    // the grid's first tile to keep the entry count right
                    let stride = SplinedRun::stride(nx);
                    for ty in 0..SplinedRun::SIDE {
                        for tx in 0..SplinedRun::SIDE {
                            jac.put(i_var_intrinsics + ty * stride + 2 * tx + i_xy, 0.0);
                        }
                    }
                }
                None => {
                    for j in 0..layout.model.n_distortion_params() {
                        jac.put(i_var_intrinsics + n_core_state + j, 0.0);
                    }
                }
            },
        }
    }
}

pub(crate) fn assemble<W: JacobianWriter>(
    ctx: &Assembly<'_>,
    x: &mut [f64],
    jac: &mut W,
) -> Result<()> {
    debug_assert_eq!(x.len(), ctx.n_measurements);

    let layout = &ctx.layout;
    let details = &layout.details;
    let splined_nx = ctx.splined_nx();
    let w_n = ctx.object_width_n;

    let want = GradientRequest {
        intrinsics: details.do_optimize_intrinsic_core
            || details.do_optimize_intrinsic_distortions,
        camera: details.do_optimize_extrinsics,
        frame: details.do_optimize_frames,
        warp: details.do_optimize_calobject_warp,
    };
    let warp = ctx.calobject_warp;

    let mut i_meas = 0;
    let mut i_feature = 0;

    for obs in ctx.observations_board {
        let i_camera = obs.i_camera;
        let i_var_intrinsics = layout.index_intrinsics(i_camera);
        let i_var_camera_rt = (details.do_optimize_extrinsics && i_camera != 0)
            .then(|| layout.index_camera_rt(i_camera));
        let i_var_frame_rt =
            details.do_optimize_frames.then(|| layout.index_frame_rt(obs.i_frame));
        let i_var_warp =
            details.do_optimize_calobject_warp.then(|| layout.index_calobject_warp());

        let camera_rt = (i_camera != 0).then(|| &ctx.extrinsics[i_camera - 1]);
        let xf = JointTransform::new(camera_rt, &ctx.frames[obs.i_frame]);
        let intrinsics = ctx.camera_intrinsics(i_camera);

        for iy in 0..w_n {
            for ix in 0..w_n {
                let corner = &obs.corners[iy * w_n + ix];
                let weight =
                    corner.weight * roi_weight(ctx.roi, i_camera, corner.x, corner.y);
                let live = !obs.skip && !ctx.outliers[i_feature];

                if live {
                    let (p_ref, dz_dwarp) =
                        board_point(ix, iy, ctx.object_spacing, w_n, warp);
                    let c = project_point(
                        &layout.model,
                        intrinsics,
                        &xf,
                        &p_ref,
                        want.warp.then_some(dz_dwarp),
                        want,
                    )?;
                    let observed = [corner.x, corner.y];

                    for i_xy in 0..2 {
                        jac.begin_row();
                        x[i_meas] = (c.q[i_xy] - observed[i_xy]) * weight;

                        emit_intrinsics_row(
                            jac,
                            layout,
                            splined_nx,
                            i_var_intrinsics,
                            i_xy,
                            c.intrinsics.as_ref().map(|g| (g, weight)),
                        );
                        if let Some(col) = i_var_camera_rt {
                            emit_pose3(
                                jac,
                                col,
                                c.dq_drcamera.as_ref().unwrap(),
                                i_xy,
                                weight * SCALE_ROTATION_CAMERA,
                            );
                            emit_pose3(
                                jac,
                                col + 3,
                                c.dq_dtcamera.as_ref().unwrap(),
                                i_xy,
                                weight * SCALE_TRANSLATION_CAMERA,
                            );
                        }
                        if let Some(col) = i_var_frame_rt {
                            emit_pose3(
                                jac,
                                col,
                                c.dq_drframe.as_ref().unwrap(),
                                i_xy,
                                weight * SCALE_ROTATION_FRAME,
                            );
                            emit_pose3(
                                jac,
                                col + 3,
                                c.dq_dtframe.as_ref().unwrap(),
                                i_xy,
                                weight * SCALE_TRANSLATION_FRAME,
                            );
                        }
                        if let Some(col) = i_var_warp {
                            let dw = c.dq_dwarp.as_ref().unwrap();
                            jac.put2(
                                col,
                                dw[(i_xy, 0)] * weight * SCALE_CALOBJECT_WARP,
                                dw[(i_xy, 1)] * weight * SCALE_CALOBJECT_WARP,
                            );
                        }
                        i_meas += 1;
                    }
                } else {
                    // keep the rows; zero residual. The frame entries get
                    // arbitrary unequal filler for skip-flagged observations
                    // so the frame stays observable.
                    let filler = if obs.skip { 1.0 } else { 0.0 };
                    for i_xy in 0..2 {
                        jac.begin_row();
                        x[i_meas] = 0.0;

                        emit_intrinsics_row(
                            jac,
                            layout,
                            splined_nx,
                            i_var_intrinsics,
                            i_xy,
                            None,
                        );
                        if let Some(col) = i_var_camera_rt {
                            jac.put3(col, 0.0, 0.0, 0.0);
                            jac.put3(col + 3, 0.0, 0.0, 0.0);
                        }
                        if let Some(col) = i_var_frame_rt {
                            jac.put3(
                                col,
                                filler * RANK_FILLER[0],
                                filler * RANK_FILLER[1],
                                filler * RANK_FILLER[2],
                            );
                            jac.put3(
                                col + 3,
                                filler * RANK_FILLER[3],
                                filler * RANK_FILLER[4],
                                filler * RANK_FILLER[5],
                            );
                        }
                        if let Some(col) = i_var_warp {
                            jac.put2(col, 0.0, 0.0);
                        }
                        i_meas += 1;
                    }
                }
                i_feature += 1;
            }
        }
    }

    for obs in ctx.observations_point {
        let i_camera = obs.i_camera;
        let i_var_intrinsics = layout.index_intrinsics(i_camera);
        let i_var_camera_rt = (details.do_optimize_extrinsics && i_camera != 0)
            .then(|| layout.index_camera_rt(i_camera));
        let i_var_point =
            details.do_optimize_frames.then(|| layout.index_point(obs.i_point));

        let camera_rt = (i_camera != 0).then(|| &ctx.extrinsics[i_camera - 1]);
        let intrinsics = ctx.camera_intrinsics(i_camera);
        let point = ctx.points[obs.i_point];
        let weight = obs.weight * roi_weight(ctx.roi, i_camera, obs.x, obs.y);

        // a point at an impossible range means a terrible solution; blow up
        // the residual so the solver backs off rather than aborting
        let invalid_point_scale = if point.z <= 0.0 || point.z >= POINT_MAXZ {
            tracing::debug!(
                "point {} has invalid distance z = {}; scaling its residuals up",
                obs.i_point,
                point.z
            );
            1e6
        } else {
            1.0
        };

        if !obs.skip {
            let point_want = GradientRequest { warp: false, ..want };
            let c = project_position(
                &layout.model,
                intrinsics,
                camera_rt,
                &point,
                point_want,
            )?;
            let observed = [obs.x, obs.y];

            for i_xy in 0..2 {
                jac.begin_row();
                x[i_meas] =
                    (c.q[i_xy] - observed[i_xy]) * invalid_point_scale * weight;

                emit_intrinsics_row(
                    jac,
                    layout,
                    splined_nx,
                    i_var_intrinsics,
                    i_xy,
                    c.intrinsics.as_ref().map(|g| (g, invalid_point_scale * weight)),
                );
                if let Some(col) = i_var_camera_rt {
                    emit_pose3(
                        jac,
                        col,
                        c.dq_drcamera.as_ref().unwrap(),
                        i_xy,
                        invalid_point_scale * weight * SCALE_ROTATION_CAMERA,
                    );
                    emit_pose3(
                        jac,
                        col + 3,
                        c.dq_dtcamera.as_ref().unwrap(),
                        i_xy,
                        invalid_point_scale * weight * SCALE_TRANSLATION_CAMERA,
                    );
                }
                if let Some(col) = i_var_point {
                    // dq/dtframe is the point-position gradient here
                    emit_pose3(
                        jac,
                        col,
                        c.dq_dtframe.as_ref().unwrap(),
                        i_xy,
                        invalid_point_scale * weight * SCALE_POSITION_POINT,
                    );
                }
                i_meas += 1;
            }

            if let Some(dist) = obs.dist.filter(|d| *d > 0.0) {
                jac.begin_row();
                if i_camera == 0 {
                    let range = point.norm();
                    x[i_meas] = (range - dist) * DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M;
                    if let Some(col) = i_var_point {
                        let scale = DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M / range
                            * SCALE_POSITION_POINT;
                        jac.put3(col, scale * point.x, scale * point.y, scale * point.z);
                    }
                } else {
                    let camera_rt = &ctx.extrinsics[i_camera - 1];
                    let (rotated, d_rotated_dr, rot) = rotate_point(&camera_rt.r, &point);
                    let p_cam = rotated + camera_rt.t;
                    let range = p_cam.norm();
                    let range_recip = 1.0 / range;
                    x[i_meas] = (range - dist) * DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M;

                    if let Some(col) = i_var_camera_rt {
                        let d_range_dr = d_rotated_dr.transpose() * p_cam * range_recip;
                        jac.put3(
                            col,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_ROTATION_CAMERA
                                * d_range_dr.x,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_ROTATION_CAMERA
                                * d_range_dr.y,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_ROTATION_CAMERA
                                * d_range_dr.z,
                        );
                        let d_range_dt = p_cam * range_recip;
                        jac.put3(
                            col + 3,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_TRANSLATION_CAMERA
                                * d_range_dt.x,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_TRANSLATION_CAMERA
                                * d_range_dt.y,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_TRANSLATION_CAMERA
                                * d_range_dt.z,
                        );
                    }
                    if let Some(col) = i_var_point {
                        let d_range_dpoint = rot.transpose() * p_cam * range_recip;
                        jac.put3(
                            col,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_POSITION_POINT
                                * d_range_dpoint.x,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_POSITION_POINT
                                * d_range_dpoint.y,
                            DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M
                                * SCALE_POSITION_POINT
                                * d_range_dpoint.z,
                        );
                    }
                }
                i_meas += 1;
            }
        } else {
            let filler = 1.0;
            for i_xy in 0..2 {
                jac.begin_row();
                x[i_meas] = 0.0;
                emit_intrinsics_row(jac, layout, splined_nx, i_var_intrinsics, i_xy, None);
                if let Some(col) = i_var_camera_rt {
                    jac.put3(col, 0.0, 0.0, 0.0);
                    jac.put3(col + 3, 0.0, 0.0, 0.0);
                }
                if let Some(col) = i_var_point {
                    jac.put3(
                        col,
                        filler * RANK_FILLER[0],
                        filler * RANK_FILLER[1],
                        filler * RANK_FILLER[2],
                    );
                }
                i_meas += 1;
            }
            if obs.has_range() {
                jac.begin_row();
                x[i_meas] = 0.0;
                if let Some(col) = i_var_camera_rt {
                    jac.put3(col, 0.0, 0.0, 0.0);
                    jac.put3(col + 3, 0.0, 0.0, 0.0);
                }
                if let Some(col) = i_var_point {
                    jac.put3(col, 0.0, 0.0, 0.0);
                }
                i_meas += 1;
            }
        }
    }

    emit_regularization(ctx, x, jac, &mut i_meas);

    debug_assert_eq!(i_meas, ctx.n_measurements);
    Ok(())
}

// Favor small distortions and a centered principal point. The scales aim the
// total regularization cost at ~0.5% of the expected observation cost so the
// data always dominates.
fn emit_regularization<W: JacobianWriter>(
    ctx: &Assembly<'_>,
    x: &mut [f64],
    jac: &mut W,
    i_meas: &mut usize,
) {
    let layout = &ctx.layout;
    let details = &layout.details;

    if details.do_skip_regularization
        || matches!(layout.model, LensModel::SplinedStereographic(_))
        || !(details.do_optimize_intrinsic_distortions || details.do_optimize_intrinsic_core)
    {
        return;
    }

    let n_intr_all = layout.model.n_lens_params();
    let n_core = if layout.model.has_core() { 4 } else { 0 };
    let n_core_state =
        if details.do_optimize_intrinsic_core && layout.model.has_core() { 4 } else { 0 };
    let n_dist_all = n_intr_all - n_core;
    let ncameras = layout.ncameras;

    let n_meas_reg_distortion = ncameras * n_dist_all;
    let n_meas_reg_centerpixel = ncameras * 2;
    let n_meas_nonreg =
        ctx.n_measurements - n_meas_reg_distortion - n_meas_reg_centerpixel;

    // at the expected pixel error of ~1, the observation rows cost this much
    let expected_total_pixel_error_sq = n_meas_nonreg as f64;

    let scale_regularization_distortion = {
        let normal_distortion_value = 0.2;
        let expected_sq_noscale = n_meas_reg_distortion as f64 * normal_distortion_value;
        (expected_total_pixel_error_sq * 0.005 / 2.0 / expected_sq_noscale).sqrt()
    };
    let scale_regularization_centerpixel = {
        let normal_centerpixel_offset: f64 = 50.0;
        let expected_sq_noscale =
            n_meas_reg_centerpixel as f64 * normal_centerpixel_offset.powi(2);
        (expected_total_pixel_error_sq * 0.005 / 2.0 / expected_sq_noscale).sqrt()
    };

    for i_camera in 0..ncameras {
        let i_var_intrinsics = layout.index_intrinsics(i_camera);
        let intrinsics = ctx.camera_intrinsics(i_camera);

        if details.do_optimize_intrinsic_distortions {
            for j in 0..n_dist_all {
                let mut scale = scale_regularization_distortion;
                // A rational radial model can reach scale ~ 0/0 ~ 1 with
                // badly-behaved derivatives; keeping the denominator
                // coefficients small prevents that, so they get regularized
                // harder.
                if layout.model.is_opencv() && n_dist_all >= 8 && (5..=7).contains(&j) {
                    scale *= 5.0;
                }

                // eps keeps the gradient finite at zero
                let eps = 1e-3;
                let d = intrinsics[n_core + j];
                let sign = if d < 0.0 { -1.0 } else { 1.0 };
                let err_no_sign = (d.abs() + eps).sqrt();

                jac.begin_row();
                x[*i_meas] = sign * err_no_sign * scale;
                jac.put(
                    i_var_intrinsics + n_core_state + j,
                    scale * SCALE_DISTORTION / (2.0 * err_no_sign),
                );
                *i_meas += 1;
            }
        }

        if details.do_optimize_intrinsic_core {
            // a decentered principal point is degenerate with pitching and
            // yawing the camera; break the symmetry
            let cx_target = 0.5 * (ctx.imagersizes[i_camera][0] as f64 - 1.0);
            let cy_target = 0.5 * (ctx.imagersizes[i_camera][1] as f64 - 1.0);

            jac.begin_row();
            x[*i_meas] = scale_regularization_centerpixel * (intrinsics[2] - cx_target);
            jac.put(
                i_var_intrinsics + 2,
                scale_regularization_centerpixel * SCALE_INTRINSICS_CENTER_PIXEL,
            );
            *i_meas += 1;

            jac.begin_row();
            x[*i_meas] = scale_regularization_centerpixel * (intrinsics[3] - cy_target);
            jac.put(
                i_var_intrinsics + 3,
                scale_regularization_centerpixel * SCALE_INTRINSICS_CENTER_PIXEL,
            );
            *i_meas += 1;
        }
    }
}
