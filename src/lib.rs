//! # k-sqlite-backup
//!
//! Online, incremental SQLite backups driven from a single owner thread.
//!
//! A [`Coordinator`](backup::coordinator::Coordinator) owns one native backup
//! cursor between two open connections. Each `step` copies a bounded number of
//! pages on a shared rayon pool and reports back on the owner thread through
//! an [`OwnerLoop`](backup::owner_loop::OwnerLoop), so the owner never blocks
//! on disk I/O.
//!
//! ## Features
//!
//! - **Single-flight steps**: at most one step per coordinator is ever in flight
//! - **Retryable vs fatal errors**: busy/locked rounds can simply be stepped again
//! - **Safe teardown**: dropping a coordinator mid-step defers the release
//! - **Job driver**: rate-limited rounds, progress callbacks, bounded busy retries
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_sqlite_backup::backup::coordinator::{Coordinator, StepOutcome};
//! use k_sqlite_backup::backup::cursor::sqlite::share;
//! use k_sqlite_backup::backup::owner_loop::OwnerLoop;
//! use k_sqlite_backup::backup::page_count::PageCount;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(rayon::ThreadPoolBuilder::new().build()?);
//! let owner = OwnerLoop::new(pool);
//! let source = share(rusqlite::Connection::open("app.db")?);
//! let destination = share(rusqlite::Connection::open("app.backup.db")?);
//!
//! let coordinator = Coordinator::create(&owner, &source, &destination, "main")?;
//! coordinator.step(PageCount::All, |res| match res {
//!     Ok(StepOutcome::Done { total }) => println!("copied {total} pages"),
//!     other => println!("{other:?}"),
//! })?;
//! owner.run()?;
//! println!("{:?}", coordinator.finish()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
