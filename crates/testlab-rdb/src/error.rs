//! Matching engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RdbError {
    #[error("state store error: {0}")]
    State(#[from] testlab_state::StateError),
}

pub type RdbResult<T> = Result<T, RdbError>;
