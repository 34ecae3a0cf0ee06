//! Validation functions for configuration values.
//!
//! Checks that the source is a readable SQLite database, that the destination
//! can be written, and that schema names are usable by the engine.

use rusqlite::{Connection, OpenFlags};
use validator::ValidationError;

use std::path::Path;
use std::result;
use std::sync::Arc;

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access directory {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

pub fn validate_sql_file<P: AsRef<Path>>(path: P) -> result::Result<(), ValidationError> {
    let path = path.as_ref();
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .and_then(|conn| conn.query_row("PRAGMA schema_version", [], |_| Ok(())))
    .map_err(|e| {
        ValidationError::new("InvalidSqlFile")
            .with_message(format!("cannot open sql file {:?}: {}", path, e).into())
    })
}

/// The destination file may not exist yet, but its directory has to.
pub fn validate_destination_path<P: AsRef<Path>>(path: P) -> Result<(), ValidationError> {
    let path = path.as_ref();
    if path.is_dir() {
        return Err(ValidationError::new("InvalidDestination")
            .with_message(format!("{:?} is a directory", path).into()));
    }
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => validate_dir_exist_or_created(parent),
        None => Ok(()),
    }
}

pub fn validate_schema_name(name: &Arc<str>) -> Result<(), ValidationError> {
    if name.is_empty() || name.contains('\0') {
        return Err(ValidationError::new("InvalidSchemaName")
            .with_message(format!("Invalid schema name: {name:?}").into()));
    }

    Ok(())
}
