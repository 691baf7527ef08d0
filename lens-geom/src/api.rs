//! Batch forward projection and iterative unprojection.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{Matrix2, Matrix2x3, Owned, Vector2, Vector3, U2};

use crate::error::{Error, Result};
use crate::models::LensModel;
use crate::project::{
    self, GradientRequest, IntrinsicGradients, SplinedRun,
};

/// Which outputs [project] should produce beyond the pixels themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionWants {
    pub dq_dintrinsics: bool,
    pub dq_dp: bool,
}

/// Batch projection results.
#[derive(Debug, Clone)]
pub struct Projected {
    pub q: Vec<[f64; 2]>,
    /// Dense row-major (N, 2, Nintrinsics) gradients. Models with sparse
    /// intrinsics gradients are densified here.
    pub dq_dintrinsics: Option<Vec<f64>>,
    /// One 2x3 gradient per point.
    pub dq_dp: Option<Vec<Matrix2x3<f64>>>,
}

fn check_intrinsics(model: &LensModel, intrinsics: &[f64]) -> Result<()> {
    let expected = model.n_lens_params();
    if intrinsics.len() != expected {
        return Err(Error::WrongIntrinsicsCount { expected, actual: intrinsics.len() });
    }
    Ok(())
}

/// Project camera-frame points through a lens model.
///
/// CAHVORE is supported only without gradients.
pub fn project(
    points: &[Vector3<f64>],
    model: &LensModel,
    intrinsics: &[f64],
    wants: ProjectionWants,
) -> Result<Projected> {
    check_intrinsics(model, intrinsics)?;

    if *model == LensModel::Cahvore {
        if wants.dq_dintrinsics || wants.dq_dp {
            return Err(Error::UnsupportedOperation(
                "CAHVORE is supported for plain projection only, without gradients",
            ));
        }
        let mut q = Vec::with_capacity(points.len());
        for p in points {
            q.push(project::project_cahvore(intrinsics, p)?);
        }
        return Ok(Projected { q, dq_dintrinsics: None, dq_dp: None });
    }

    let n_intrinsics = model.n_lens_params();
    let mut q = Vec::with_capacity(points.len());
    let mut dq_dintrinsics =
        wants.dq_dintrinsics.then(|| vec![0.0; points.len() * 2 * n_intrinsics]);
    let mut dq_dp = wants.dq_dp.then(|| Vec::with_capacity(points.len()));

    let want = GradientRequest {
        intrinsics: wants.dq_dintrinsics,
        frame: wants.dq_dp,
        ..Default::default()
    };

    for (i, p) in points.iter().enumerate() {
        let c = project::project_position(model, intrinsics, None, p, want)?;
        q.push(c.q);

        if let Some(buf) = &mut dq_dintrinsics {
            let base = i * 2 * n_intrinsics;
            match c.intrinsics.as_ref().unwrap() {
                IntrinsicGradients::Parametric { dq_dfxy, nocore, n_dist } => {
                    for i_xy in 0..2 {
                        let row = &mut buf[base + i_xy * n_intrinsics..][..n_intrinsics];
                        // fxy is diagonal, cxy is the identity
                        row[i_xy] = dq_dfxy[i_xy];
                        row[2 + i_xy] = 1.0;
                        row[4..4 + n_dist].copy_from_slice(&nocore[i_xy][..*n_dist]);
                    }
                }
                IntrinsicGradients::Splined(run) => {
                    let nx = match model {
                        LensModel::SplinedStereographic(config) => config.nx,
                        _ => unreachable!(),
                    };
                    let stride = SplinedRun::stride(nx);
                    for i_xy in 0..2 {
                        for ty in 0..SplinedRun::SIDE {
                            for tx in 0..SplinedRun::SIDE {
                                buf[base
                                    + i_xy * n_intrinsics
                                    + run.ivar0
                                    + ty * stride
                                    + 2 * tx
                                    + i_xy] = run.coefficient(tx, ty, i_xy);
                            }
                        }
                    }
                }
            }
        }
        if let Some(out) = &mut dq_dp {
            // the identity transform makes dq/dtframe the point gradient
            out.push(c.dq_dtframe.unwrap());
        }
    }

    Ok(Projected { q, dq_dintrinsics, dq_dp })
}

/// Project (x, y, 1) points. `dq_dvxy` of the result is the leading 2x2
/// block of dq/dp.
pub fn project_z1(
    vxy: &[[f64; 2]],
    model: &LensModel,
    intrinsics: &[f64],
    wants: ProjectionWants,
) -> Result<(Projected, Option<Vec<Matrix2<f64>>>)> {
    let points: Vec<Vector3<f64>> =
        vxy.iter().map(|v| Vector3::new(v[0], v[1], 1.0)).collect();
    let projected = project(&points, model, intrinsics, wants)?;
    let dq_dvxy = projected.dq_dp.as_ref().map(|grads| {
        grads
            .iter()
            .map(|d| Matrix2::new(d[(0, 0)], d[(0, 1)], d[(1, 0)], d[(1, 1)]))
            .collect()
    });
    Ok((projected, dq_dvxy))
}

#[derive(Clone)]
struct UnprojectProblem<'a> {
    model: &'a LensModel,
    intrinsics: &'a [f64],
    target: [f64; 2],
    v: Vector2<f64>,
}

impl UnprojectProblem<'_> {
    fn projection(&self) -> Option<project::CornerProjection> {
        let p = Vector3::new(self.v.x, self.v.y, 1.0);
        project::project_position(
            self.model,
            self.intrinsics,
            None,
            &p,
            GradientRequest { frame: true, ..Default::default() },
        )
        .ok()
    }
}

impl LeastSquaresProblem<f64, U2, U2> for UnprojectProblem<'_> {
    type ParameterStorage = Owned<f64, U2>;
    type ResidualStorage = Owned<f64, U2>;
    type JacobianStorage = Owned<f64, U2, U2>;

    fn set_params(&mut self, x: &Vector2<f64>) {
        self.v = *x;
    }

    fn params(&self) -> Vector2<f64> {
        self.v
    }

    fn residuals(&self) -> Option<Vector2<f64>> {
        let c = self.projection()?;
        Some(Vector2::new(c.q[0] - self.target[0], c.q[1] - self.target[1]))
    }

    fn jacobian(&self) -> Option<Matrix2<f64>> {
        let c = self.projection()?;
        let d = c.dq_dtframe?;
        Some(Matrix2::new(d[(0, 0)], d[(0, 1)], d[(1, 0)], d[(1, 1)]))
    }
}

fn unproject_impl(
    pixels: &[[f64; 2]],
    model: &LensModel,
    intrinsics: &[f64],
) -> Result<Vec<[f64; 2]>> {
    check_intrinsics(model, intrinsics)?;
    if *model == LensModel::Cahvore {
        return Err(Error::UnsupportedOperation("unproject(CAHVORE) is not implemented"));
    }
    if !model.has_core() {
        return Err(Error::UnsupportedOperation(
            "unprojection requires a model with a pinhole core",
        ));
    }

    let fx_recip = 1.0 / intrinsics[0];
    let fy_recip = 1.0 / intrinsics[1];
    let (cx, cy) = (intrinsics[2], intrinsics[3]);

    let mut out = Vec::with_capacity(pixels.len());

    if *model == LensModel::Pinhole {
        for q in pixels {
            out.push([(q[0] - cx) * fx_recip, (q[1] - cy) * fy_recip]);
        }
        return Ok(out);
    }

    let mut complained = false;
    for q in pixels {
        // seed with the pinhole inverse of the distorted pixel
        let seed = Vector2::new((q[0] - cx) * fx_recip, (q[1] - cy) * fy_recip);
        let problem = UnprojectProblem { model, intrinsics, target: *q, v: seed };
        let (problem, _report) = LevenbergMarquardt::new().minimize(problem);
        let norm2 = problem.residuals().map_or(f64::INFINITY, |r| r.norm_squared());
        if norm2 / 2.0 > 1e-4 {
            if !complained {
                tracing::warn!(
                    "unprojection failed to converge (norm2 = {norm2}); \
                     reporting NaN for the affected pixels"
                );
                complained = true;
            }
            out.push([f64::NAN, f64::NAN]);
        } else {
            out.push([problem.v.x, problem.v.y]);
        }
    }
    Ok(out)
}

/// Map pixels back to camera-frame direction vectors with z = 1 exactly.
///
/// Iterative: seeds with the pinhole inverse, then solves the projection
/// residual with the trust-region solver. Pixels that fail to converge come
/// back as NaN, with one warning per call.
pub fn unproject(
    pixels: &[[f64; 2]],
    model: &LensModel,
    intrinsics: &[f64],
) -> Result<Vec<Vector3<f64>>> {
    Ok(unproject_impl(pixels, model, intrinsics)?
        .into_iter()
        .map(|xy| Vector3::new(xy[0], xy[1], 1.0))
        .collect())
}

/// [unproject], without the redundant z = 1 column.
pub fn unproject_z1(
    pixels: &[[f64; 2]],
    model: &LensModel,
    intrinsics: &[f64],
) -> Result<Vec<[f64; 2]>> {
    unproject_impl(pixels, model, intrinsics)
}
