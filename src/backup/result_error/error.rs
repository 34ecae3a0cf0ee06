use crate::backup::result_error::engine::EngineError;
use crate::backup::result_error::usage::UsageError;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use itertools::Itertools;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("source and destination must be distinct connections")]
    SameConnection,
    #[error("invalid schema name {0:?}: must not contain a nul byte")]
    InvalidSchemaName(String),
    #[error("destination connection has an open transaction; commit or roll it back before backup")]
    DestinationInTransaction,
    #[error("gave up after {attempts} busy/locked step results:\n{}", indent::indent_all_with("  ", last.to_string()))]
    BusyRetriesExhausted { attempts: u32, last: EngineError },
    #[error("owner loop stopped before {0} pending step(s) completed")]
    OwnerLoopDisconnected(usize),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(Error::into_iter)),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Looks through context wrappers for the engine error underneath, if any.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Error::Engine(e) => Some(e),
            Error::BusyRetriesExhausted { last, .. } => Some(last),
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.engine_error()
            }
            Error::LotsOfError(errors) => errors.iter().find_map(Error::engine_error),
            _ => None,
        }
    }

    /// Looks through context wrappers for a usage error underneath, if any.
    pub fn usage_error(&self) -> Option<UsageError> {
        match self {
            Error::Usage(e) => Some(*e),
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.usage_error()
            }
            _ => None,
        }
    }
}
