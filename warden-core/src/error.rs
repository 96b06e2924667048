use thiserror::Error;

use crate::changes::ChangeError;
use crate::edit::EditError;
use crate::eval::EvalError;
use crate::locks::LockError;
use crate::package::PackageError;
use crate::policy::validate::ValidationReport;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("policy validation failed:\n{0}")]
    Validation(ValidationReport),

    #[error("evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("edit error: {0}")]
    Edit(#[from] EditError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("change tracking error: {0}")]
    Changes(#[from] ChangeError),

    #[error("package module error: {0}")]
    Package(#[from] PackageError),

    #[error(transparent)]
    Json(#[from] crate::policy::json::PolicyJsonError),

    #[error("bundle not found: {0}")]
    BundleNotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;
