use crate::model::ModelError;
use crate::store::StoreError;
use crate::types::IdentityId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FacesError {
    #[error("face database unavailable")]
    DatabaseUnavailable,
    #[error("identity {0} not found")]
    IdentityNotFound(IdentityId),
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}
