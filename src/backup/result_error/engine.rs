//! Native engine failures, passed through with the code and message the engine gave.

use rusqlite::ffi;
use rusqlite::ffi::ErrorCode;
use std::ffi::{c_int, CStr};
use std::fmt::{Display, Formatter};

/// An error reported by the native backup cursor.
///
/// The code is the (possibly extended) result code returned by the engine and
/// the message is whatever text the engine attached to it. Neither is
/// reinterpreted; the only thing added on top is [`EngineError::is_retryable`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineError {
    code: c_int,
    message: String,
}

impl EngineError {
    pub fn new<S: Into<String>>(code: c_int, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds an error from a bare result code using the engine's own description.
    pub fn from_code(code: c_int) -> Self {
        // Safety: sqlite3_errstr returns a pointer to a static string for any code.
        let message = unsafe { cstr_to_string(ffi::sqlite3_errstr(code)) };
        Self::new(code, message)
    }

    /// Reads the most recent error recorded on a connection handle.
    ///
    /// # Safety
    ///
    /// `db` must be a valid, open `sqlite3*` that no other thread is using.
    pub(crate) unsafe fn from_connection(db: *mut ffi::sqlite3) -> Self {
        let code = ffi::sqlite3_extended_errcode(db);
        let message = cstr_to_string(ffi::sqlite3_errmsg(db));
        Self::new(code, message)
    }

    pub fn code(&self) -> c_int {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> ErrorCode {
        ffi::Error::new(self.code).code
    }

    /// Busy and locked mean another connection currently holds a lock on the
    /// source or destination. Progress is kept and the step can be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        )
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (sqlite code {})", self.message, self.code)
    }
}

impl std::error::Error for EngineError {}

unsafe fn cstr_to_string(ptr: *const std::ffi::c_char) -> String {
    if ptr.is_null() {
        "unknown error".to_string()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}
