//! The optimization-state vector: layout, packing and scaling.
//!
//! The solver sees every variable divided by a fixed per-block scale, so the
//! trust region (a ball in state space) treats all of them comparably. The
//! scales don't need to be precise; they only bring the variables to the
//! same order of magnitude. Changing them re-baselines every uncertainty
//! output, so they are constants of the wire format.
//!
//! Packed layout, in order:
//!
//! ```text
//! intrinsics_cam0 .. intrinsics_camN-1
//! extrinsics_cam1 .. extrinsics_camN-1      (camera 0 is the reference)
//! frame0 .. frameF-1
//! point0 .. pointP-1
//! calobject_warp
//! ```
//!
//! Only blocks whose optimize-flag is set are present.

use std::f64::consts::PI;

use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};

use lens_geom::{LensModel, Pose};

pub const SCALE_INTRINSICS_FOCAL_LENGTH: f64 = 500.0;
pub const SCALE_INTRINSICS_CENTER_PIXEL: f64 = 20.0;
pub const SCALE_ROTATION_CAMERA: f64 = 0.1 * PI / 180.0;
pub const SCALE_TRANSLATION_CAMERA: f64 = 1.0;
pub const SCALE_ROTATION_FRAME: f64 = 15.0 * PI / 180.0;
pub const SCALE_TRANSLATION_FRAME: f64 = 100.0;
pub const SCALE_POSITION_POINT: f64 = SCALE_TRANSLATION_FRAME;
pub const SCALE_CALOBJECT_WARP: f64 = 0.01;
// hard-coded to 1.0; the distortion-regularization scale assumes it
pub const SCALE_DISTORTION: f64 = 1.0;

/// One range residual counts like this many pixels per meter of error.
pub const DISTANCE_ERROR_EQUIVALENT_PIXELS_PER_M: f64 = 1.0;

/// Tracked points must sit in front of the reference camera and not
/// unreasonably far: 0 < z < POINT_MAXZ. Violations blow up the residual
/// instead of failing the solve.
pub const POINT_MAXZ: f64 = 50_000.0;

/// What the optimization is allowed to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProblemDetails {
    pub do_optimize_intrinsic_core: bool,
    pub do_optimize_intrinsic_distortions: bool,
    pub do_optimize_extrinsics: bool,
    pub do_optimize_frames: bool,
    pub do_optimize_calobject_warp: bool,
    pub do_skip_regularization: bool,
}

impl ProblemDetails {
    /// Optimize everything, with regularization on.
    pub fn all() -> Self {
        ProblemDetails {
            do_optimize_intrinsic_core: true,
            do_optimize_intrinsic_distortions: true,
            do_optimize_extrinsics: true,
            do_optimize_frames: true,
            do_optimize_calobject_warp: true,
            do_skip_regularization: false,
        }
    }
}

/// The dimensions that fix the packed-state layout.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub model: LensModel,
    pub details: ProblemDetails,
    pub ncameras: usize,
    pub nframes: usize,
    pub npoints: usize,
}

impl Layout {
    pub fn n_distortion_optimization_params(&self) -> usize {
        if !self.details.do_optimize_intrinsic_distortions {
            return 0;
        }
        self.model.n_distortion_params()
    }

    pub fn n_intrinsics_optimization_params(&self) -> usize {
        let mut n = self.n_distortion_optimization_params();
        if self.details.do_optimize_intrinsic_core && self.model.has_core() {
            n += 4;
        }
        n
    }

    pub fn n_state(&self) -> usize {
        let mut n = self.ncameras * self.n_intrinsics_optimization_params();
        if self.details.do_optimize_extrinsics {
            n += (self.ncameras - 1) * 6;
        }
        if self.details.do_optimize_frames {
            n += self.nframes * 6 + self.npoints * 3;
        }
        if self.details.do_optimize_calobject_warp {
            n += 2;
        }
        n
    }

    pub fn index_intrinsics(&self, i_camera: usize) -> usize {
        i_camera * self.n_intrinsics_optimization_params()
    }

    /// Undefined for camera 0: it is pinned to the identity and owns no
    /// state.
    pub fn index_camera_rt(&self, i_camera: usize) -> usize {
        debug_assert!(i_camera >= 1);
        self.ncameras * self.n_intrinsics_optimization_params() + (i_camera - 1) * 6
    }

    pub fn index_frame_rt(&self, i_frame: usize) -> usize {
        self.ncameras * self.n_intrinsics_optimization_params()
            + if self.details.do_optimize_extrinsics { (self.ncameras - 1) * 6 } else { 0 }
            + i_frame * 6
    }

    pub fn index_point(&self, i_point: usize) -> usize {
        self.index_frame_rt(self.nframes) + i_point * 3
    }

    pub fn index_calobject_warp(&self) -> usize {
        self.index_point(self.npoints)
    }

    /// Scale of intrinsic state `i` within one camera's intrinsic block.
    pub fn intrinsics_scale(&self, mut i: usize) -> f64 {
        if self.details.do_optimize_intrinsic_core && self.model.has_core() {
            if i < 4 {
                if i < 2 {
                    return SCALE_INTRINSICS_FOCAL_LENGTH;
                }
                return SCALE_INTRINSICS_CENTER_PIXEL;
            }
            i -= 4;
        }
        debug_assert!(i < self.n_distortion_optimization_params());
        SCALE_DISTORTION
    }

    /// The per-variable scale of the whole packed state, in layout order.
    pub fn scales(&self) -> DVector<f64> {
        let mut s = DVector::zeros(self.n_state());
        let mut i = 0;
        let n_intr = self.n_intrinsics_optimization_params();
        for _ in 0..self.ncameras {
            for j in 0..n_intr {
                s[i] = self.intrinsics_scale(j);
                i += 1;
            }
        }
        if self.details.do_optimize_extrinsics {
            for _ in 1..self.ncameras {
                for _ in 0..3 {
                    s[i] = SCALE_ROTATION_CAMERA;
                    i += 1;
                }
                for _ in 0..3 {
                    s[i] = SCALE_TRANSLATION_CAMERA;
                    i += 1;
                }
            }
        }
        if self.details.do_optimize_frames {
            for _ in 0..self.nframes {
                for _ in 0..3 {
                    s[i] = SCALE_ROTATION_FRAME;
                    i += 1;
                }
                for _ in 0..3 {
                    s[i] = SCALE_TRANSLATION_FRAME;
                    i += 1;
                }
            }
            for _ in 0..self.npoints {
                for _ in 0..3 {
                    s[i] = SCALE_POSITION_POINT;
                    i += 1;
                }
            }
        }
        if self.details.do_optimize_calobject_warp {
            s[i] = SCALE_CALOBJECT_WARP;
            s[i + 1] = SCALE_CALOBJECT_WARP;
            i += 2;
        }
        debug_assert_eq!(i, s.len());
        s
    }

    /// Scale a physical-units state vector (already in packed layout) into
    /// unit-scale values in place.
    pub fn pack_vector(&self, v: &mut [f64]) {
        let scales = self.scales();
        debug_assert_eq!(v.len(), scales.len());
        for (value, scale) in v.iter_mut().zip(scales.iter()) {
            *value /= scale;
        }
    }

    /// Scale a unit-scale state vector back into physical units in place.
    pub fn unpack_vector(&self, v: &mut [f64]) {
        let scales = self.scales();
        debug_assert_eq!(v.len(), scales.len());
        for (value, scale) in v.iter_mut().zip(scales.iter()) {
            *value *= scale;
        }
    }

    /// Pack the physical parameter blocks into a unit-scale state vector.
    pub fn pack(
        &self,
        intrinsics: &[f64],
        extrinsics: &[Pose],
        frames: &[Pose],
        points: &[Vector3<f64>],
        calobject_warp: Option<&[f64; 2]>,
    ) -> DVector<f64> {
        let mut p = DVector::zeros(self.n_state());
        let mut i = 0;
        let n_intr_all = self.model.n_lens_params();
        let n_core = if self.model.has_core() { 4 } else { 0 };

        for i_camera in 0..self.ncameras {
            let intr = &intrinsics[i_camera * n_intr_all..][..n_intr_all];
            if self.details.do_optimize_intrinsic_core && self.model.has_core() {
                p[i] = intr[0] / SCALE_INTRINSICS_FOCAL_LENGTH;
                p[i + 1] = intr[1] / SCALE_INTRINSICS_FOCAL_LENGTH;
                p[i + 2] = intr[2] / SCALE_INTRINSICS_CENTER_PIXEL;
                p[i + 3] = intr[3] / SCALE_INTRINSICS_CENTER_PIXEL;
                i += 4;
            }
            if self.details.do_optimize_intrinsic_distortions {
                for d in &intr[n_core..] {
                    p[i] = d / SCALE_DISTORTION;
                    i += 1;
                }
            }
        }

        if self.details.do_optimize_extrinsics {
            for rt in extrinsics {
                for k in 0..3 {
                    p[i + k] = rt.r[k] / SCALE_ROTATION_CAMERA;
                    p[i + 3 + k] = rt.t[k] / SCALE_TRANSLATION_CAMERA;
                }
                i += 6;
            }
        }

        if self.details.do_optimize_frames {
            for rt in frames {
                for k in 0..3 {
                    p[i + k] = rt.r[k] / SCALE_ROTATION_FRAME;
                    p[i + 3 + k] = rt.t[k] / SCALE_TRANSLATION_FRAME;
                }
                i += 6;
            }
            for point in points {
                for k in 0..3 {
                    p[i + k] = point[k] / SCALE_POSITION_POINT;
                }
                i += 3;
            }
        }

        if self.details.do_optimize_calobject_warp {
            let warp = calobject_warp.expect("warp optimization requires a warp seed");
            p[i] = warp[0] / SCALE_CALOBJECT_WARP;
            p[i + 1] = warp[1] / SCALE_CALOBJECT_WARP;
            i += 2;
        }

        debug_assert_eq!(i, p.len());
        p
    }

    /// Unpack a unit-scale state vector into the physical parameter blocks.
    /// Blocks whose optimize-flag is off are left untouched.
    pub fn unpack(
        &self,
        p: &DVector<f64>,
        intrinsics: &mut [f64],
        extrinsics: &mut [Pose],
        frames: &mut [Pose],
        points: &mut [Vector3<f64>],
        calobject_warp: Option<&mut [f64; 2]>,
    ) {
        debug_assert_eq!(p.len(), self.n_state());
        let mut i = 0;
        let n_intr_all = self.model.n_lens_params();
        let n_core = if self.model.has_core() { 4 } else { 0 };

        for i_camera in 0..self.ncameras {
            let intr = &mut intrinsics[i_camera * n_intr_all..][..n_intr_all];
            if self.details.do_optimize_intrinsic_core && self.model.has_core() {
                intr[0] = p[i] * SCALE_INTRINSICS_FOCAL_LENGTH;
                intr[1] = p[i + 1] * SCALE_INTRINSICS_FOCAL_LENGTH;
                intr[2] = p[i + 2] * SCALE_INTRINSICS_CENTER_PIXEL;
                intr[3] = p[i + 3] * SCALE_INTRINSICS_CENTER_PIXEL;
                i += 4;
            }
            if self.details.do_optimize_intrinsic_distortions {
                for d in &mut intr[n_core..] {
                    *d = p[i] * SCALE_DISTORTION;
                    i += 1;
                }
            }
        }

        if self.details.do_optimize_extrinsics {
            for rt in extrinsics {
                for k in 0..3 {
                    rt.r[k] = p[i + k] * SCALE_ROTATION_CAMERA;
                    rt.t[k] = p[i + 3 + k] * SCALE_TRANSLATION_CAMERA;
                }
                i += 6;
            }
        }

        if self.details.do_optimize_frames {
            for rt in frames {
                for k in 0..3 {
                    rt.r[k] = p[i + k] * SCALE_ROTATION_FRAME;
                    rt.t[k] = p[i + 3 + k] * SCALE_TRANSLATION_FRAME;
                }
                i += 6;
            }
            for point in points {
                for k in 0..3 {
                    point[k] = p[i + k] * SCALE_POSITION_POINT;
                }
                i += 3;
            }
        }

        if self.details.do_optimize_calobject_warp {
            if let Some(warp) = calobject_warp {
                warp[0] = p[i] * SCALE_CALOBJECT_WARP;
                warp[1] = p[i + 1] * SCALE_CALOBJECT_WARP;
            }
            i += 2;
        }

        debug_assert_eq!(i, p.len());
    }
}
