use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, OpenFlags};
use tokio::sync::oneshot;

use crate::{log_error, log_info};

use super::migrations::run_migrations;

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "audit::db";

/// Upper bound on waiting for SQLite locks before reporting the store as
/// unavailable.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                log_error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                log_error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

/// Handle to the observation database.
///
/// Writes run as closures on one dedicated thread that owns the read-write
/// connection, so they are serialized globally. Reads open their own
/// read-only connection per call on the blocking pool and drop it on return;
/// with the WAL journal they never queue behind the writer.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("audit-db-writer".into())
            .spawn(move || {
                let mut conn = match open_writer(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    log_error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                log_info!("Database writer shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        log_info!("Database opened at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    /// Releases this handle. The writer thread stops and is joined once the
    /// last clone is closed or dropped.
    pub fn close(self) {
        if let Ok(inner) = Arc::try_unwrap(self.inner) {
            drop(inner);
            log_info!("Database closed at {}", self.db_path.display());
        }
    }

    /// Runs `task` on the writer thread.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                log_error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Runs `task` against a fresh read-only connection.
    pub async fn read<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = open_reader(&path)?;
            task(&conn)
        })
        .await
        .map_err(|err| anyhow!("database reader task failed: {err}"))?
    }
}

fn open_writer(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL mode")?;
    // FULL makes every commit durable before the caller sees its id.
    conn.pragma_update(None, "synchronous", "FULL")
        .context("failed to set synchronous mode")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;

    Ok(conn)
}

fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open SQLite database {} for reading", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    Ok(conn)
}
