//! Service loop: answer dials, accept them and hand each to a handler.

use std::any::Any;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::connection::Connection;
use crate::listener::Listener;
use crate::Error;
use crate::Result;
use crate::RussConfig;

const CHANNEL_CAPACITY: usize = 100;

/// Server-side view of an answered connection, as the loop needs it.
pub trait AnsweredConnection: Send + 'static {
    /// Exchanges the default descriptor set with the dialer.
    fn accept_default(&mut self) -> Result<()>;

    fn release(self);
}

/// Anything the loop can answer dials from.
pub trait ConnectionSource {
    type Conn: AnsweredConnection;

    fn answer(&self, timeout: Duration) -> Result<Self::Conn>;
}

impl AnsweredConnection for Connection {
    fn accept_default(&mut self) -> Result<()> {
        self.accept_with_pipes()
    }

    fn release(self) {
        Connection::release(self)
    }
}

impl ConnectionSource for Listener {
    type Conn = Connection;

    fn answer(&self, timeout: Duration) -> Result<Connection> {
        Listener::answer(self, timeout)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// accept → handler → release. The connection is released on every path,
/// including a panicking handler.
fn dispatch<C, A, H>(mut conn: C, accept: &A, handler: &H)
where
    C: AnsweredConnection,
    A: Fn(&mut C) -> Result<()>,
    H: Fn(&mut C) -> i32,
{
    match accept(&mut conn) {
        Ok(()) => match panic::catch_unwind(AssertUnwindSafe(|| handler(&mut conn))) {
            Ok(0) => debug!("Handler finished"),
            Ok(status) => debug!(status, "Handler finished with non-zero status"),
            Err(payload) => error!(panic = panic_message(&*payload), "Handler panicked"),
        },
        Err(e) => warn!(error = %e, "Failed to accept connection"),
    }
    conn.release();
}

struct WorkerPool<C> {
    workers: Vec<thread::JoinHandle<()>>,
    sender: SyncSender<C>,
}

impl<C: AnsweredConnection> WorkerPool<C> {
    fn new<J>(size: usize, job: Arc<J>) -> std::io::Result<Self>
    where
        J: Fn(C) + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel::<C>(CHANNEL_CAPACITY);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let job = Arc::clone(&job);

            let spawned = thread::Builder::new()
                .name(format!("russ-worker-{}", id))
                .spawn(move || loop {
                    let conn = {
                        let lock = match receiver.lock() {
                            Ok(l) => l,
                            Err(e) => {
                                error!(worker_id = id, error = %e, "Worker receiver lock poisoned");
                                break;
                            }
                        };
                        match lock.recv_timeout(Duration::from_millis(100)) {
                            Ok(conn) => conn,
                            Err(mpsc::RecvTimeoutError::Timeout) => continue,
                            Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        }
                    };
                    job(conn);
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(worker_id = id, error = %e, "Failed to spawn worker"),
            }
        }

        if workers.is_empty() {
            return Err(std::io::Error::other("Failed to spawn any worker threads"));
        }
        if workers.len() < size {
            warn!(
                requested = size,
                spawned = workers.len(),
                "Running with fewer workers than requested"
            );
        }
        Ok(Self { workers, sender })
    }

    /// Queues `conn`, blocking while the queue is full.
    fn execute(&self, conn: C) {
        if let Err(mpsc::SendError(conn)) = self.sender.send(conn) {
            warn!("Worker pool gone, releasing connection");
            conn.release();
        }
    }

    /// Stops taking work and waits for queued connections to finish.
    fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

/// Runs the answer → accept → handler → release cycle until shut down.
#[derive(Debug, Clone)]
pub struct Server {
    workers: usize,
    answer_tick: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(&RussConfig::default())
    }
}

impl Server {
    pub fn new(config: &RussConfig) -> Self {
        Self {
            workers: config.workers,
            answer_tick: config.answer_tick,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares an externally owned shutdown flag (e.g. one set by a signal handler).
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Serves `source` until the shutdown flag is set or the source fails,
    /// accepting every connection with its default descriptor set.
    ///
    /// With `workers == 0` every connection is handled on the calling thread;
    /// otherwise the calling thread only answers and a fixed pool runs the
    /// handlers. The handler's return value is an exit status and is only
    /// logged. Queued connections are drained before this returns.
    pub fn run<S, H>(&self, source: &S, handler: H) -> Result<()>
    where
        S: ConnectionSource,
        H: Fn(&mut S::Conn) -> i32 + Send + Sync + 'static,
    {
        self.run_with(source, |conn: &mut S::Conn| conn.accept_default(), handler)
    }

    /// Like [`run`](Self::run), but `accept` completes each answered
    /// connection, e.g. by handing the dialer descriptors of its own choosing.
    /// When `accept` fails the handler is skipped; the connection is released
    /// either way.
    pub fn run_with<S, A, H>(&self, source: &S, accept: A, handler: H) -> Result<()>
    where
        S: ConnectionSource,
        A: Fn(&mut S::Conn) -> Result<()> + Send + Sync + 'static,
        H: Fn(&mut S::Conn) -> i32 + Send + Sync + 'static,
    {
        let job = Arc::new(move |conn: S::Conn| dispatch(conn, &accept, &handler));
        let pool = match self.workers {
            0 => None,
            n => Some(WorkerPool::new(n, Arc::clone(&job))?),
        };
        info!(workers = self.workers, "Service loop started");

        let result = self.answer_loop(source, |conn| match &pool {
            Some(pool) => pool.execute(conn),
            None => job(conn),
        });

        if let Some(pool) = pool {
            pool.shutdown();
        }
        info!("Service loop stopped");
        result
    }

    fn answer_loop<S, F>(&self, source: &S, mut hand_off: F) -> Result<()>
    where
        S: ConnectionSource,
        F: FnMut(S::Conn),
    {
        while !self.shutdown.load(Ordering::Relaxed) {
            match source.answer(self.answer_tick) {
                Ok(conn) => hand_off(conn),
                Err(Error::AnswerTimeout) => {}
                Err(Error::ListenerClosed) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    return Err(Error::ListenerClosed);
                }
                Err(e) => warn!(error = %e, "Failed to answer dial"),
            }
        }
        Ok(())
    }
}

/// Serves `listener` with the environment's configuration.
pub fn serve<H>(listener: &Listener, handler: H) -> Result<()>
where
    H: Fn(&mut Connection) -> i32 + Send + Sync + 'static,
{
    Server::new(&RussConfig::from_env()).run(listener, handler)
}
