//! Per-client request pipeline.
//!
//! A reader parses frames, routes and dispatches their sub-commands, and
//! queues the resulting tasks. A writer drains that queue strictly in order,
//! collecting the backend replies for each task and writing one merged reply.
//! Reply order therefore always matches request order, whatever order the
//! backends answer in.

use super::connection_pool::{BackendConnection, ConnectionPool, PoolError};
use super::protocols::{
    error_reply, merge_replies, read_command, write_frame, CommandFrame, ProtocolError,
};
use super::route_table::BucketRouter;
use super::splitter::{split, SubCommand};
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

/// Default capacity of the reader -> writer queue
pub const DEFAULT_PIPELINE_DEPTH: usize = 1024;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Dispatching,
    AwaitingReplies,
    Merged,
    Written,
}

/// Backend failure of a single sub-command
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("backend {addr} unavailable: {source}")]
    Acquire {
        addr: String,
        #[source]
        source: PoolError,
    },
    #[error("write to backend {addr} failed: {source}")]
    Write {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read from backend {addr} failed: {source}")]
    Read {
        addr: String,
        #[source]
        source: ProtocolError,
    },
    #[error("backend {addr} did not reply within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
}

impl TaskError {
    pub fn addr(&self) -> &str {
        match self {
            TaskError::Acquire { addr, .. }
            | TaskError::Write { addr, .. }
            | TaskError::Read { addr, .. }
            | TaskError::Timeout { addr, .. } => addr,
        }
    }
}

/// A sub-command after its dispatch attempt
struct Dispatched {
    addr: String,
    conn: Result<BackendConnection, TaskError>,
}

enum TaskBody {
    /// Reply decided without backend I/O
    Immediate(Vec<u8>),
    Dispatched(Vec<Dispatched>),
}

/// One client command from parse to written reply
pub struct Task {
    id: u64,
    state: TaskState,
    body: TaskBody,
    /// Close the client connection once this reply is written
    close_after: bool,
}

impl Task {
    fn new(body: TaskBody) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            state: TaskState::Created,
            body,
            close_after: false,
        }
    }

    fn failed(err: &ProtocolError) -> Self {
        let mut task = Self::new(TaskBody::Immediate(error_reply(&err.to_string())));
        task.close_after = err.desynchronizes_stream();
        task
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    fn advance(&mut self, next: TaskState) {
        trace!("Task {} {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

/// Merge per-sub-command outcomes in decomposition order.
///
/// Any failure turns the whole reply into a single error; partial arrays are
/// never produced.
pub fn merge_outcomes(outcomes: Vec<Result<Vec<u8>, TaskError>>) -> Vec<u8> {
    let mut replies = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Ok(reply) => replies.push(reply),
            Err(e) => return error_reply(&e.to_string()),
        }
    }
    merge_replies(replies)
}

/// Shared state needed to serve client connections
#[derive(Clone)]
pub struct Pipeline {
    router: Arc<BucketRouter>,
    pool: Arc<ConnectionPool>,
    read_timeout: Duration,
    depth: usize,
}

impl Pipeline {
    pub fn new(
        router: Arc<BucketRouter>,
        pool: Arc<ConnectionPool>,
        read_timeout: Duration,
        depth: usize,
    ) -> Self {
        Self {
            router,
            pool,
            read_timeout,
            depth: depth.max(1),
        }
    }

    /// Serve one client connection until it closes
    pub async fn serve<S>(&self, stream: S) -> Result<(), PipelineError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (task_tx, task_rx) = mpsc::channel::<Task>(self.depth);
        let (exit_tx, exit_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(self.clone().run_writer(write_half, task_rx, exit_rx));
        let read_result = self
            .run_reader(BufReader::new(read_half), task_tx, exit_tx)
            .await;
        let write_result = writer
            .await
            .map_err(|e| PipelineError::WriterFailed(e.to_string()))?;

        read_result.and(write_result)
    }

    async fn run_reader<R>(
        &self,
        mut reader: R,
        tasks: mpsc::Sender<Task>,
        exit: oneshot::Sender<()>,
    ) -> Result<(), PipelineError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        loop {
            let next = tokio::select! {
                next = read_command(&mut reader) => next,
                _ = tasks.closed() => {
                    debug!("Writer stopped, closing reader");
                    return Ok(());
                }
            };

            let task = match next {
                Ok(Some(frame)) => self.build_task(&frame).await,
                Ok(None) => {
                    debug!("Client closed connection");
                    return Ok(());
                }
                Err(ProtocolError::Io(e)) => {
                    let _ = exit.send(());
                    return Err(PipelineError::ClientRead(e));
                }
                Err(e) => {
                    warn!("Rejecting malformed frame: {}", e);
                    Task::failed(&e)
                }
            };

            let close_after = task.close_after;
            if let Err(mpsc::error::SendError(task)) = tasks.send(task).await {
                self.discard(task);
                return Ok(());
            }
            if close_after {
                debug!("Closing client connection after format error");
                return Ok(());
            }
        }
    }

    /// Split, route and dispatch one frame
    async fn build_task(&self, frame: &CommandFrame) -> Task {
        let subs = match split(frame) {
            Ok(subs) => subs,
            Err(e) => {
                debug!("Rejecting command: {}", e);
                return Task::failed(&e);
            }
        };

        let addrs = match self
            .router
            .resolve_all(subs.iter().map(|s| s.key.as_slice()))
        {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Routing failed: {}", e);
                return Task::new(TaskBody::Immediate(error_reply(&e.to_string())));
            }
        };

        let mut task = Task::new(TaskBody::Dispatched(Vec::new()));
        task.advance(TaskState::Dispatching);
        debug!(
            "Task {} dispatching {} sub-command(s) for '{}'",
            task.id,
            subs.len(),
            frame.name_lowercase()
        );

        let pool = &self.pool;
        let dispatched = join_all(
            subs.into_iter()
                .zip(addrs)
                .map(|(sub, addr)| async move {
                    let conn = dispatch_one(pool, &addr, &sub).await;
                    Dispatched { addr, conn }
                }),
        )
        .await;

        task.body = TaskBody::Dispatched(dispatched);
        task
    }

    async fn run_writer<W>(
        self,
        mut writer: W,
        mut tasks: mpsc::Receiver<Task>,
        mut exit: oneshot::Receiver<()>,
    ) -> Result<(), PipelineError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut exit_armed = true;
        let result = loop {
            let task = tokio::select! {
                biased;
                signal = &mut exit, if exit_armed => {
                    exit_armed = false;
                    // A dropped sender is a normal reader exit; keep draining
                    if signal.is_ok() {
                        debug!("Reader aborted, stopping writer");
                        break Ok(());
                    }
                    continue;
                }
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break Ok(()),
                },
            };

            if let Err(e) = self.complete(task, &mut writer).await {
                break Err(e);
            }
        };

        tasks.close();
        while let Ok(task) = tasks.try_recv() {
            self.discard(task);
        }

        result
    }

    /// Await replies, merge, write, and release the task's connections
    async fn complete<W>(&self, mut task: Task, writer: &mut W) -> Result<(), PipelineError>
    where
        W: AsyncWrite + Unpin,
    {
        let body = std::mem::replace(&mut task.body, TaskBody::Immediate(Vec::new()));
        let (reply, releases) = match body {
            TaskBody::Immediate(reply) => (reply, Vec::new()),
            TaskBody::Dispatched(dispatched) => {
                task.advance(TaskState::AwaitingReplies);
                self.collect_replies(task.id, dispatched).await
            }
        };
        task.advance(TaskState::Merged);

        let written = write_frame(writer, &reply).await;
        for (addr, conn) in releases {
            self.pool.put(&addr, conn);
        }
        written.map_err(PipelineError::ClientWrite)?;

        task.advance(TaskState::Written);
        Ok(())
    }

    async fn collect_replies(
        &self,
        task_id: u64,
        dispatched: Vec<Dispatched>,
    ) -> (Vec<u8>, Vec<(String, Option<BackendConnection>)>) {
        let read_timeout = self.read_timeout;
        let results = join_all(
            dispatched
                .into_iter()
                .map(|d| await_reply(d, read_timeout)),
        )
        .await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut releases = Vec::with_capacity(results.len());
        for (addr, conn, outcome) in results {
            if let Err(e) = &outcome {
                warn!("Task {} sub-command failed: {}", task_id, e);
            }
            releases.push((addr, conn));
            outcomes.push(outcome);
        }

        (merge_outcomes(outcomes), releases)
    }

    /// Release a task that will never be answered; its connections are out of sync
    fn discard(&self, task: Task) {
        if let TaskBody::Dispatched(dispatched) = task.body {
            for d in dispatched {
                drop(d.conn);
                self.pool.put(&d.addr, None);
            }
        }
    }
}

async fn dispatch_one(
    pool: &ConnectionPool,
    addr: &str,
    sub: &SubCommand,
) -> Result<BackendConnection, TaskError> {
    let mut conn = pool.get(addr).await.map_err(|source| {
        if let PoolError::UnknownAddress(_) = source {
            error!("No connection pool for routed backend {}", addr);
        }
        TaskError::Acquire {
            addr: addr.to_string(),
            source,
        }
    })?;

    trace!("Sub-command {} -> {}", sub.index, addr);
    conn.send(&sub.payload)
        .await
        .map_err(|source| TaskError::Write {
            addr: addr.to_string(),
            source,
        })?;
    Ok(conn)
}

/// Read one sub-command's reply; the connection comes back only when it is still in sync
async fn await_reply(
    dispatched: Dispatched,
    read_timeout: Duration,
) -> (String, Option<BackendConnection>, Result<Vec<u8>, TaskError>) {
    let Dispatched { addr, conn } = dispatched;
    let mut conn = match conn {
        Ok(conn) => conn,
        Err(e) => return (addr, None, Err(e)),
    };

    match tokio::time::timeout(read_timeout, conn.read_reply()).await {
        Ok(Ok(reply)) => (addr, Some(conn), Ok(reply)),
        Ok(Err(source)) => {
            let err = TaskError::Read {
                addr: addr.clone(),
                source,
            };
            (addr, None, Err(err))
        }
        Err(_) => {
            let err = TaskError::Timeout {
                addr: addr.clone(),
                timeout: read_timeout,
            };
            (addr, None, Err(err))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("client read failed: {0}")]
    ClientRead(#[source] std::io::Error),
    #[error("client write failed: {0}")]
    ClientWrite(#[source] std::io::Error),
    #[error("writer task failed: {0}")]
    WriterFailed(String),
}
