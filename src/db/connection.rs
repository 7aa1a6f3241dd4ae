use std::{
    mem,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Owns the SQLite thread. Dropping the last handle closes the job channel,
/// which ends the thread's loop, then waits for it.
struct Worker {
    jobs: mpsc::Sender<Job>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let (closed, _) = mpsc::channel();
        drop(mem::replace(&mut self.jobs, closed));
        if let Some(thread) = self.thread.take() {
            if let Err(err) = thread.join() {
                error!("database thread panicked: {err:?}");
            }
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database at {}", path.display()))?;
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        error!("failed to enable WAL mode: {err}");
    }
    conn.busy_timeout(BUSY_TIMEOUT)?;
    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

/// SQLite store served by one dedicated thread. Clones share that thread and
/// jobs run against the connection in submission order.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    path: Arc<PathBuf>,
}

impl Database {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (jobs, queue) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let thread_path = path.clone();

        let thread = thread::Builder::new()
            .name("chainlock-db".into())
            .spawn(move || {
                let mut conn = match open_connection(&thread_path) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                for job in queue {
                    job(&mut conn);
                }
                info!("database thread for {} stopped", thread_path.display());
            })
            .context("failed to spawn database thread")?;

        ready_rx
            .recv()
            .context("database thread exited during startup")??;
        info!("database ready at {}", path.display());

        Ok(Self {
            worker: Arc::new(Worker {
                jobs,
                thread: Some(thread),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Runs `job` on the database thread and waits for its result.
    pub async fn execute<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.worker
            .jobs
            .send(Box::new(move |conn| {
                // The caller may have been cancelled; its result is then dropped.
                let _ = reply_tx.send(job(conn));
            }))
            .map_err(|_| anyhow!("database thread is not running"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread dropped the job"))?
    }
}
