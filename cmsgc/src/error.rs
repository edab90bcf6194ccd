use cmsgc_arena::ArenaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GcError {
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),

    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),
}

pub type GcResult<T> = Result<T, GcError>;
