//! [`BackupCursor`] over SQLite's online backup API.

use crate::backup::cursor::{BackupCursor, StepReport};
use crate::backup::page_count::PageCount;
use crate::backup::result_error::engine::EngineError;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use getset::Getters;
use rusqlite::{ffi, Connection};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

/// A connection shared between its owner and any cursor reading or writing it.
///
/// The cursor only ever holds a clone: it never closes the connection, it
/// just keeps it alive until the native cursor is released.
pub type SharedConnection = Arc<Mutex<Connection>>;

pub fn share(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

pub(crate) fn default_schema() -> Arc<str> {
    "main".into()
}

/// Which attached databases to copy between.
#[derive(Clone, Debug, Builder, Getters, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct BackupOptions {
    #[serde(default = "default_schema")]
    #[builder(default = default_schema(), into)]
    source_schema: Arc<str>,
    #[serde(default = "default_schema")]
    #[builder(default = default_schema(), into)]
    destination_schema: Arc<str>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Owns one `sqlite3_backup*` plus keep-alive references to both connections.
///
/// Every native call holds both connection mutexes so the owner cannot touch
/// either connection while a step is running. Workers wait for the pair in
/// address order; the owner thread only ever tries them and backs off as busy.
pub struct SqliteCursor {
    // Released in Drop, before the connection references below go away.
    raw: Option<NonNull<ffi::sqlite3_backup>>,
    source: SharedConnection,
    destination: SharedConnection,
}

// Safety: the backup handle is only used while both connection mutexes are
// held, and it is never used from two threads at once because the cursor is
// moved rather than shared.
unsafe impl Send for SqliteCursor {}

fn lock(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    // A panic elsewhere does not invalidate the sqlite3 handle itself.
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

type ConnectionPair<'a> = (MutexGuard<'a, Connection>, MutexGuard<'a, Connection>);

/// Waits for both connections, always taking the lower address first so that
/// two cursors crossing the same pair in opposite directions cannot deadlock.
fn lock_pair<'a>(
    source: &'a SharedConnection,
    destination: &'a SharedConnection,
) -> ConnectionPair<'a> {
    if Arc::as_ptr(source) < Arc::as_ptr(destination) {
        let src = lock(source);
        (src, lock(destination))
    } else {
        let dst = lock(destination);
        (lock(source), dst)
    }
}

fn try_lock(conn: &SharedConnection) -> std::result::Result<MutexGuard<'_, Connection>, EngineError> {
    match conn.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(EngineError::new(
            ffi::SQLITE_BUSY,
            "connection is in use by a backup step in flight",
        )),
    }
}

/// Owner-side variant of [`lock_pair`]: never waits, reports busy instead.
fn try_lock_pair<'a>(
    source: &'a SharedConnection,
    destination: &'a SharedConnection,
) -> std::result::Result<ConnectionPair<'a>, EngineError> {
    let src = try_lock(source)?;
    Ok((src, try_lock(destination)?))
}

fn finish_raw(raw: NonNull<ffi::sqlite3_backup>) -> std::result::Result<(), EngineError> {
    // Safety: raw came from sqlite3_backup_init, is finished exactly once and
    // both of its connections are locked by the caller.
    match unsafe { ffi::sqlite3_backup_finish(raw.as_ptr()) } {
        ffi::SQLITE_OK => Ok(()),
        code => Err(EngineError::from_code(code)),
    }
}

fn schema_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidSchemaName(name.to_string()))
}

impl SqliteCursor {
    pub fn new(
        source: &SharedConnection,
        destination: &SharedConnection,
        options: &BackupOptions,
    ) -> Result<Self> {
        if Arc::ptr_eq(source, destination) {
            return Err(Error::SameConnection);
        }
        let source_schema = schema_name(options.source_schema())?;
        let destination_schema = schema_name(options.destination_schema())?;

        let (src, dst) = try_lock_pair(source, destination)?;
        if !dst.is_autocommit() {
            return Err(Error::DestinationInTransaction);
        }

        // Safety: both handles come from live connections whose mutexes are
        // held for the duration of the call, and the schema names are valid
        // nul-terminated strings.
        let raw = unsafe {
            ffi::sqlite3_backup_init(
                dst.handle(),
                destination_schema.as_ptr(),
                src.handle(),
                source_schema.as_ptr(),
            )
        };
        let raw = NonNull::new(raw)
            // Safety: init failures are recorded on the destination handle, still locked here.
            .ok_or_else(|| unsafe { EngineError::from_connection(dst.handle()) })?;
        drop(dst);
        drop(src);

        tracing::debug!(
            "Initialized sqlite backup {} -> {}",
            options.source_schema(),
            options.destination_schema()
        );
        Ok(Self {
            raw: Some(raw),
            source: source.clone(),
            destination: destination.clone(),
        })
    }
}

impl BackupCursor for SqliteCursor {
    fn step(&mut self, pages: PageCount) -> StepReport {
        let Some(raw) = self.raw else {
            return StepReport::Failed(EngineError::from_code(ffi::SQLITE_MISUSE));
        };
        let _guards = lock_pair(&self.source, &self.destination);

        // Safety: raw is live until finished and both connections are locked.
        let (rc, remaining, total) = unsafe {
            let rc = ffi::sqlite3_backup_step(raw.as_ptr(), pages.as_native());
            (
                rc,
                ffi::sqlite3_backup_remaining(raw.as_ptr()),
                ffi::sqlite3_backup_pagecount(raw.as_ptr()),
            )
        };
        let remaining = u32::try_from(remaining).unwrap_or(0);
        let total = u32::try_from(total).unwrap_or(0);

        match rc {
            ffi::SQLITE_DONE => StepReport::Done { total },
            ffi::SQLITE_OK if remaining == 0 => StepReport::Done { total },
            ffi::SQLITE_OK => StepReport::Progress { remaining, total },
            code => StepReport::Failed(EngineError::from_code(code)),
        }
    }

    fn finish(&mut self) -> std::result::Result<(), EngineError> {
        let Some(raw) = self.raw else {
            return Ok(());
        };
        let _guards = try_lock_pair(&self.source, &self.destination)?;
        self.raw = None;
        finish_raw(raw)
    }
}

impl Drop for SqliteCursor {
    fn drop(&mut self) {
        let Some(raw) = self.raw.take() else {
            return;
        };
        let _guards = lock_pair(&self.source, &self.destination);
        if let Err(e) = finish_raw(raw) {
            tracing::warn!("Dropped unfinished sqlite backup: {e}");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use rusqlite::ffi::ErrorCode;
    use rusqlite::OpenFlags;

    fn step_pages(n: u32) -> PageCount {
        PageCount::pages(n).unwrap()
    }

    #[test]
    fn test_bounded_steps_count_down_to_done() {
        let source = seeded_source(100);
        let destination = empty_memory();
        let mut cursor =
            SqliteCursor::new(&source, &destination, &BackupOptions::default()).unwrap();

        let mut last_remaining = u32::MAX;
        let mut rounds = 0;
        let total = loop {
            rounds += 1;
            match cursor.step(step_pages(4)) {
                StepReport::Progress { remaining, total } => {
                    assert!(remaining < last_remaining);
                    assert!(remaining < total);
                    last_remaining = remaining;
                }
                StepReport::Done { total } => break total,
                StepReport::Failed(e) => panic!("unexpected failure: {e}"),
            }
        };

        assert!(rounds > 2, "expected several rounds, got {rounds}");
        assert!(total > 8);
        cursor.finish().unwrap();
        assert_eq!(row_count(&destination), 100);
    }

    #[test]
    fn test_all_pages_in_one_round() {
        let source = seeded_source(50);
        let destination = empty_memory();
        let mut cursor =
            SqliteCursor::new(&source, &destination, &BackupOptions::default()).unwrap();

        match cursor.step(PageCount::All) {
            StepReport::Done { total } => assert!(total > 0),
            other => panic!("expected done, got {other:?}"),
        }
        cursor.finish().unwrap();
        assert_eq!(row_count(&destination), 50);
    }

    #[test]
    fn test_same_connection_is_rejected() {
        let source = seeded_source(1);
        let res = SqliteCursor::new(&source, &source, &BackupOptions::default());
        assert!(matches!(res, Err(Error::SameConnection)));
    }

    #[test]
    fn test_nul_in_schema_name_is_rejected() {
        let options = BackupOptions::builder().destination_schema("ma\0in").build();
        let res = SqliteCursor::new(&seeded_source(1), &empty_memory(), &options);
        assert!(matches!(res, Err(Error::InvalidSchemaName(_))));
    }

    #[test]
    fn test_unknown_destination_schema_reports_native_error() {
        let options = BackupOptions::builder().destination_schema("nowhere").build();
        let res = SqliteCursor::new(&seeded_source(1), &empty_memory(), &options);
        match res {
            Err(Error::Engine(e)) => {
                assert_eq!(e.kind(), ErrorCode::Unknown);
                assert!(e.message().contains("nowhere"), "{}", e.message());
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected init failure"),
        }
    }

    #[test]
    fn test_destination_in_transaction_is_rejected() {
        let destination = empty_memory();
        lock(&destination).execute_batch("BEGIN").unwrap();
        let res = SqliteCursor::new(&seeded_source(1), &destination, &BackupOptions::default());
        assert!(matches!(res, Err(Error::DestinationInTransaction)));
    }

    #[test]
    fn test_locked_destination_fails_with_busy_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.db");
        let destination = share(impatient(&path));
        let locker = impatient(&path);
        locker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let source = seeded_source(20);
        let mut cursor =
            SqliteCursor::new(&source, &destination, &BackupOptions::default()).unwrap();
        match cursor.step(PageCount::All) {
            StepReport::Failed(e) => assert!(e.is_retryable(), "{e}"),
            other => panic!("expected busy, got {other:?}"),
        }

        locker.execute_batch("COMMIT").unwrap();
        assert!(matches!(cursor.step(PageCount::All), StepReport::Done { .. }));
        cursor.finish().unwrap();
        assert_eq!(row_count(&destination), 20);
    }

    #[test]
    fn test_read_only_destination_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE placeholder(x)")
            .unwrap();
        let destination = share(
            Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap(),
        );

        let mut cursor =
            SqliteCursor::new(&seeded_source(5), &destination, &BackupOptions::default()).unwrap();
        match cursor.step(PageCount::All) {
            StepReport::Failed(e) => {
                assert!(!e.is_retryable());
                assert_eq!(e.kind(), ErrorCode::ReadOnly);
            }
            other => panic!("expected read-only failure, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_releases_cursor_and_keeps_connections_usable() {
        let source = seeded_source(10);
        let destination = empty_memory();
        {
            let mut cursor =
                SqliteCursor::new(&source, &destination, &BackupOptions::default()).unwrap();
            assert!(matches!(cursor.step(step_pages(1)), StepReport::Progress { .. }));
        }
        assert_eq!(Arc::strong_count(&source), 1);
        assert_eq!(Arc::strong_count(&destination), 1);
        assert_eq!(row_count(&source), 10);
    }

    #[test]
    fn test_owner_side_calls_report_busy_instead_of_waiting() {
        let source = seeded_source(5);
        let destination = empty_memory();
        let mut cursor =
            SqliteCursor::new(&source, &destination, &BackupOptions::default()).unwrap();

        let held = source.lock().unwrap();
        match SqliteCursor::new(&source, &empty_memory(), &BackupOptions::default()) {
            Err(Error::Engine(e)) => assert_eq!(e.kind(), ErrorCode::DatabaseBusy),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected busy"),
        }
        let busy = cursor.finish().unwrap_err();
        assert!(busy.is_retryable(), "{busy}");
        drop(held);

        assert!(matches!(cursor.step(PageCount::All), StepReport::Done { .. }));
        cursor.finish().unwrap();
        assert_eq!(row_count(&destination), 5);
    }

    #[test]
    fn test_crossed_cursors_do_not_deadlock() {
        let x = seeded_source(30);
        let y = seeded_source(30);
        let mut forward = SqliteCursor::new(&x, &y, &BackupOptions::default()).unwrap();
        let mut backward = SqliteCursor::new(&y, &x, &BackupOptions::default()).unwrap();

        let held = x.lock().unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let forward_tx = done_tx.clone();
        let forward = std::thread::spawn(move || {
            let report = forward.step(PageCount::All);
            forward_tx.send(()).unwrap();
            (forward, report)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        let backward = std::thread::spawn(move || {
            let report = backward.step(PageCount::All);
            done_tx.send(()).unwrap();
            (backward, report)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(held);

        for _ in 0..2 {
            done_rx
                .recv_timeout(std::time::Duration::from_secs(10))
                .expect("crossed steps finished");
        }
        for handle in [forward, backward] {
            let (mut cursor, report) = handle.join().unwrap();
            assert!(matches!(report, StepReport::Done { .. }), "{report:?}");
            cursor.finish().unwrap();
        }
    }

    #[test]
    fn test_backup_options_deserialize_defaults() {
        let options: BackupOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, BackupOptions::default());
        assert_eq!(options.source_schema().as_ref(), "main");

        let options: BackupOptions =
            serde_json::from_str(r#"{"destination_schema": "archive"}"#).unwrap();
        assert_eq!(options.destination_schema().as_ref(), "archive");
        assert!(serde_json::from_str::<BackupOptions>(r#"{"target": "x"}"#).is_err());
    }
}
