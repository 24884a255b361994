//! Server lifecycle and the per-connection dispatcher (spec.md §4.1, §4.5).
//! Wires the job manager, worker registry, and task runner together, owns
//! the accept loop, and implements the handshake.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::{Buf, BytesMut};
use chrono::Utc;
use futures::sink::SinkExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth;
use crate::config::Config;
use crate::error::FaktoryError;
use crate::manager::sweep::{
    DeadSetTrimmer, HeartbeatReaper, ReservationReaper, RetryEnqueuer, ScheduledEnqueuer,
};
use crate::manager::JobManager;
use crate::registry::WorkerRegistry;
use crate::storage::Store;
use crate::taskrunner::TaskRunner;
use crate::types::job::DEFAULT_QUEUE;
use crate::types::worker::DesiredState;
use crate::wire::{self, protocol::Command, protocol::MutateOp, protocol::Response};

/// Maximum time a handshake is allowed to take, read and write combined.
const HANDSHAKE_DEADLINE: StdDuration = StdDuration::from_secs(1);
/// How long `stop` waits after closing the listener for in-flight
/// handshakes to settle before closing the store.
const STOP_SETTLE: StdDuration = StdDuration::from_millis(100);

pub const FAKTORY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-verb command counters for `INFO`'s `server.commands` breakdown,
/// generalizing the teacher's `ServerStats` `cmd_put`/`cmd_delete`/...
/// counters to this protocol's command vocabulary.
#[derive(Default)]
struct CommandCounters {
    push: AtomicU64,
    fetch: AtomicU64,
    ack: AtomicU64,
    fail: AtomicU64,
    beat: AtomicU64,
    info: AtomicU64,
    flush: AtomicU64,
    mutate: AtomicU64,
    end: AtomicU64,
}

impl CommandCounters {
    fn record(&self, cmd: &Command) {
        let counter = match cmd {
            Command::Push(_) => &self.push,
            Command::Fetch { .. } => &self.fetch,
            Command::Ack { .. } => &self.ack,
            Command::Fail { .. } => &self.fail,
            Command::Beat { .. } => &self.beat,
            Command::Info => &self.info,
            Command::Flush => &self.flush,
            Command::Mutate(_) => &self.mutate,
            Command::End => &self.end,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn total(&self) -> u64 {
        self.push.load(Ordering::Relaxed)
            + self.fetch.load(Ordering::Relaxed)
            + self.ack.load(Ordering::Relaxed)
            + self.fail.load(Ordering::Relaxed)
            + self.beat.load(Ordering::Relaxed)
            + self.info.load(Ordering::Relaxed)
            + self.flush.load(Ordering::Relaxed)
            + self.mutate.load(Ordering::Relaxed)
            + self.end.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> serde_json::Value {
        json!({
            "push": self.push.load(Ordering::Relaxed),
            "fetch": self.fetch.load(Ordering::Relaxed),
            "ack": self.ack.load(Ordering::Relaxed),
            "fail": self.fail.load(Ordering::Relaxed),
            "beat": self.beat.load(Ordering::Relaxed),
            "info": self.info.load(Ordering::Relaxed),
            "flush": self.flush.load(Ordering::Relaxed),
            "mutate": self.mutate.load(Ordering::Relaxed),
            "end": self.end.load(Ordering::Relaxed),
        })
    }
}

pub struct Server {
    id: String,
    config: Config,
    manager: Arc<JobManager>,
    workers: Arc<WorkerRegistry>,
    task_runner: TaskRunner,
    started_at: chrono::DateTime<Utc>,
    closed: AtomicBool,
    connections: AtomicU64,
    commands: CommandCounters,
    conn_ids: AtomicU64,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Arc<Self> {
        let manager = Arc::new(JobManager::with_dead_caps(
            store,
            config.dead_set_max_size,
            chrono::Duration::days(config.dead_set_max_age_days),
        ));
        let workers = Arc::new(WorkerRegistry::new());

        let mut task_runner = TaskRunner::new();
        task_runner.register(
            "scheduled_enqueuer",
            chrono::Duration::seconds(5),
            Box::new(ScheduledEnqueuer(manager.clone())),
        );
        task_runner.register(
            "retry_enqueuer",
            chrono::Duration::seconds(5),
            Box::new(RetryEnqueuer(manager.clone())),
        );
        task_runner.register(
            "reservation_reaper",
            chrono::Duration::seconds(15),
            Box::new(ReservationReaper(manager.clone())),
        );
        task_runner.register(
            "heartbeat_reaper",
            chrono::Duration::seconds(15),
            Box::new(HeartbeatReaper(workers.clone())),
        );
        task_runner.register(
            "dead_set_trimmer",
            chrono::Duration::hours(1),
            Box::new(DeadSetTrimmer(manager.clone())),
        );

        Arc::new(Self {
            id: random_server_id(),
            config,
            manager,
            workers,
            task_runner,
            started_at: Utc::now(),
            closed: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            commands: CommandCounters::default(),
            conn_ids: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Binds the configured address. Split out from [`Server::serve`] so
    /// tests can bind an ephemeral port and learn its address before the
    /// accept loop starts.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind).await
    }

    /// Binds the listener and runs the accept loop plus the task runner
    /// until `stop` is called.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Runs the accept loop plus the task runner over an already-bound
    /// listener, until `stop` is called. Refuses new accepts once closed.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "faktory listening");

        let runner_handle = {
            let this = self.clone();
            tokio::spawn(async move {
                this.task_runner.run(this.cancel.clone()).await;
            })
        };

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, _)) => {
                            if self.closed.load(Ordering::SeqCst) {
                                continue;
                            }
                            let _ = stream.set_nodelay(true);
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.handle_connection(stream).await;
                            });
                        },
                        Err(error) => {
                            warn!(%error, "failed to accept connection");
                        },
                    }
                },
                _ = self.cancel.cancelled() => break,
            }
        }

        let _ = runner_handle.await;
        self.manager.store().close().await?;
        Ok(())
    }

    /// Marks the server closed, stops accepting, and gives in-flight
    /// handshakes a moment to settle before the store is closed in `run`.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        tokio::time::sleep(STOP_SETTLE).await;
        self.cancel.cancel();
    }

    fn next_conn_id(&self) -> u64 {
        self.conn_ids.fetch_add(1, Ordering::Relaxed)
    }

    #[instrument(name = "connection", skip_all, fields(conn_id))]
    async fn handle_connection<S>(self: Arc<Self>, mut stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let conn_id = self.next_conn_id();
        tracing::Span::current().record("conn_id", conn_id);

        self.connections.fetch_add(1, Ordering::SeqCst);

        let outcome = self.handshake(&mut stream).await;

        let hello = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                debug!(%error, "handshake failed");
                self.connections.fetch_sub(1, Ordering::SeqCst);
                return;
            },
        };

        let wid = hello.hello.wid.clone();
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        if let Some(wid) = &wid {
            self.workers.hello(
                wid.clone(),
                hello.hello.hostname.clone().unwrap_or_default(),
                hello.hello.pid.unwrap_or(0),
                hello.hello.labels.clone().unwrap_or_default().into_iter().collect(),
                conn_id,
                close_tx,
                Utc::now(),
            );
        }

        let mut framed = wire::framed(stream);
        framed.read_buffer_mut().unsplit(hello.leftover);

        loop {
            let evt = tokio::select! {
                evt = framed.next() => evt,
                _ = self.cancel.cancelled() => {
                    let _ = framed.send(Response::Error(FaktoryError::Shutdown(
                        "server is shutting down".to_string(),
                    ))).await;
                    break;
                },
                _ = close_rx.recv() => break,
            };

            let cmd = match evt {
                None => break,
                Some(Ok(cmd)) => cmd,
                Some(Err(crate::wire::decoder::Error::Client(resp))) => {
                    if framed.send(resp).await.is_err() {
                        break;
                    }
                    continue;
                },
                Some(Err(crate::wire::decoder::Error::IO(error))) => {
                    debug!(%error, "connection read error");
                    break;
                },
            };

            self.commands.record(&cmd);

            if matches!(cmd, Command::End) {
                break;
            }

            let resp = self.dispatch(cmd, wid.as_deref()).await;
            if framed.send(resp).await.is_err() {
                break;
            }
        }

        if let Some(wid) = &wid {
            self.workers.disconnect(wid, conn_id);
        }
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }

    async fn dispatch(&self, cmd: Command, wid: Option<&str>) -> Response {
        match cmd {
            Command::Push(job) => match self.manager.push(job).await {
                Ok(()) => Response::Ok,
                Err(err) => Response::Error(err),
            },
            Command::Fetch { mut queues } => {
                if queues.is_empty() {
                    queues.push(DEFAULT_QUEUE.to_string());
                }
                match self.manager.fetch(&queues, wid).await {
                    Ok(Some(job)) => match serde_json::to_vec(&job) {
                        Ok(bytes) => Response::Blob(Some(bytes)),
                        Err(_) => Response::Error(FaktoryError::Internal(
                            "failed to serialize job".to_string(),
                        )),
                    },
                    Ok(None) => Response::Blob(None),
                    Err(err) => Response::Error(err),
                }
            },
            Command::Ack { jid } => match self.manager.ack(&jid).await {
                Ok(()) => Response::Ok,
                Err(err) => Response::Error(err),
            },
            Command::Fail {
                jid,
                errtype,
                message,
                backtrace,
            } => match self.manager.fail(&jid, errtype, message, backtrace).await {
                Ok(()) => Response::Ok,
                Err(err) => Response::Error(err),
            },
            Command::Beat { wid, current_state } => {
                if let Some(state) = current_state {
                    debug!(wid, state, "worker reported state");
                }
                match self.workers.beat(&wid, Utc::now()) {
                    Some(DesiredState::Quiet) => Response::beat_signal(DesiredState::Quiet),
                    Some(DesiredState::Terminate) => {
                        Response::beat_signal(DesiredState::Terminate)
                    },
                    None => Response::Ok,
                }
            },
            Command::Info => Response::blob_json(&self.info_payload().await),
            Command::Flush => match self.manager.store().flush().await {
                Ok(()) => Response::Ok,
                Err(err) => Response::Error(err.into()),
            },
            Command::Mutate(op) => match self.mutate(op).await {
                Ok(()) => Response::Ok,
                Err(err) => Response::Error(err),
            },
            Command::End => Response::Ok,
        }
    }

    async fn mutate(&self, op: MutateOp) -> Result<(), FaktoryError> {
        use crate::wire::protocol::MutateTarget;

        let store = self.manager.store();
        let far_future = Utc::now() + chrono::Duration::days(365 * 100);

        match op {
            MutateOp::Clear { target: MutateTarget::Scheduled } => {
                store.schedule_due(far_future).await?;
            },
            MutateOp::Clear { target: MutateTarget::Retries } => {
                store.retry_due(far_future).await?;
            },
            MutateOp::Clear { target: MutateTarget::Dead } => {
                store.dead_trim(0, chrono::Duration::zero()).await?;
            },
        }

        Ok(())
    }

    async fn info_payload(&self) -> serde_json::Value {
        let store = self.manager.store();
        let default_size = store.queue_size(DEFAULT_QUEUE).await.unwrap_or(0);
        let queue_names = store.queue_names().await.unwrap_or_default();

        let mut total_enqueued = 0u64;
        for name in &queue_names {
            total_enqueued += store.queue_size(name).await.unwrap_or(0);
        }

        let total_processed = store.total_processed().await.unwrap_or(0);
        let total_failures = store.total_failures().await.unwrap_or(0);

        let uptime = (Utc::now() - self.started_at).num_seconds().max(0);

        json!({
            "server_utc_time": Utc::now().format("%H:%M:%S UTC").to_string(),
            "faktory": {
                "default_size": default_size,
                "total_failures": total_failures,
                "total_processed": total_processed,
                "total_enqueued": total_enqueued,
                "total_queues": queue_names.len() as u64,
                "tasks": self.task_runner.stats(),
            },
            "server": {
                "id": self.id,
                "faktory_version": FAKTORY_VERSION,
                "uptime": uptime,
                "connections": self.connections.load(Ordering::SeqCst),
                "command_count": self.commands.total(),
                "commands": self.commands.snapshot(),
                "used_memory_mb": used_memory_mb(),
            },
        })
    }

    async fn handshake<S>(&self, stream: &mut S) -> io::Result<HandshakeOutcome>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        tokio::time::timeout(HANDSHAKE_DEADLINE, self.handshake_inner(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))?
    }

    async fn handshake_inner<S>(&self, stream: &mut S) -> io::Result<HandshakeOutcome>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let challenge = self
            .config
            .password
            .as_ref()
            .map(|_| (auth::generate_iterations(), auth::generate_salt()));

        let hi = auth::HiDoc::new(challenge.as_ref());
        let hi_line = format!("+HI {}\r\n", serde_json::to_string(&hi).unwrap());
        stream.write_all(hi_line.as_bytes()).await?;

        let (line, leftover) = read_line(stream).await?;
        let hello_json = line
            .strip_prefix("HELLO ")
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected HELLO"))?;
        let hello: auth::HelloDoc = serde_json::from_str(hello_json)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed HELLO"))?;

        if let Some(password) = &self.config.password {
            let (iterations, salt) = challenge.expect("password implies challenge");
            let given = hello.pwdhash.as_deref().unwrap_or("");
            if !auth::verify(password, &salt, iterations, hello.v, given) {
                stream.write_all(b"-ERR Invalid password\r\n").await?;
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "invalid password",
                ));
            }
        }

        stream.write_all(b"+OK\r\n").await?;

        Ok(HandshakeOutcome { hello, leftover })
    }
}

/// Everything the handshake produces: the parsed `HELLO` document (worker
/// registration happens afterwards, once a connection id is assigned) and
/// whatever bytes the client sent past the `HELLO` line, which must seed the
/// command-loop codec's buffer rather than be discarded.
struct HandshakeOutcome {
    hello: auth::HelloDoc,
    leftover: BytesMut,
}

/// Reads one `\n`- or `\r\n`-terminated line without using a buffering
/// adapter that would discard bytes read past the line -- whatever's left
/// over is handed back so it can seed the command-loop codec's buffer.
async fn read_line<S>(stream: &mut S) -> io::Result<(String, BytesMut)>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let mut line = buf.split_to(pos);
            buf.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            let text = String::from_utf8(line.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 line"))?;
            return Ok((text, buf));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof during handshake",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn random_server_id() -> String {
    use rand::Rng;
    let bytes: [u8; 6] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(target_os = "linux")]
fn used_memory_mb() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| {
            let pages: u64 = s.split_whitespace().next()?.parse().ok()?;
            let page_size = 4096u64;
            Some(pages * page_size / (1024 * 1024))
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn used_memory_mb() -> u64 {
    0
}
