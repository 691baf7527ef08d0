use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("inconsistent data: {0}")]
    InconsistentData(&'static str),
    #[error("singular normal equations")]
    SingularNormalEquations,
    #[error("solver failure: the solver returned a non-finite cost")]
    SolverFailure,
    #[error(transparent)]
    Lens(#[from] lens_geom::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
