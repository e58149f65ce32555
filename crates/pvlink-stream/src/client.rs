//! 带重连的单向流客户端。
//!
//! # 教案式说明
//! - **Why**：日志转发这类消费方只需要“尽力送达”的字节流：目标暂时不可达时不能阻塞调用方，
//!   连接断开后要自动重建并补发尚未送出的数据；
//! - **How**：
//!   - 调用方写入有界缓冲后立即返回，超出容量的部分计数并告警后丢弃；
//!   - 后台任务按重试周期建连，连上后把缓冲写出；读方向一直被监视，对端关闭或写失败时
//!     把尚未确认的字节放回缓冲前端，关闭连接并在下个周期重连补发；
//!   - 首次连接可设尝试上限，耗尽后进入 `Failed`，直到调用 [`StreamClient::reset`]；
//! - **What**：状态通过 `watch` 通道发布，计数器通过 [`StreamStatus`] 快照读取。

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::connector::{BoxedStream, StreamConnector};
use crate::error::{CONNECT, Result, StreamError, WRITE, map_io_error};

/// 连接状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// 未连接，等待下一次尝试。
    Disconnected,
    Connecting,
    Connected,
    /// 首次连接的尝试次数已耗尽。
    Failed,
}

/// 客户端的计数快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: StreamState,
    /// 成功建连的次数。
    pub connect_count: u64,
    /// 失败的建连尝试次数。
    pub retry_count: u64,
    pub buffered_bytes: usize,
    /// 因缓冲已满而丢弃的字节数。
    pub dropped_bytes: u64,
}

struct Shared {
    config: StreamConfig,
    buffer: Mutex<BytesMut>,
    wake: Notify,
    closing: AtomicBool,
    reset: AtomicBool,
    /// 自上次成功或复位以来连续失败的次数。
    attempts: AtomicU32,
    connect_count: AtomicU64,
    retry_count: AtomicU64,
    dropped_bytes: AtomicU64,
    state: watch::Sender<StreamState>,
}

impl Shared {
    fn set_state(&self, next: StreamState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn state(&self) -> StreamState {
        *self.state.borrow()
    }
}

/// 单向流客户端句柄。
///
/// 丢弃句柄会中止后台任务；需要把缓冲写完时先调用 [`StreamClient::shutdown`]。
pub struct StreamClient {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    /// 校验配置并在 `runtime` 上启动重连任务。首次建连立即开始。
    pub fn spawn(
        config: StreamConfig,
        connector: Arc<dyn StreamConnector>,
        runtime: &Handle,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(StreamState::Disconnected);
        let shared = Arc::new(Shared {
            buffer: Mutex::new(BytesMut::with_capacity(config.buffer_capacity)),
            config,
            wake: Notify::new(),
            closing: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            connect_count: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            dropped_bytes: AtomicU64::new(0),
            state,
        });
        let task = runtime.spawn(run(Arc::clone(&shared), connector));
        Ok(Self {
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    /// 追加一条消息（带配置的前缀），返回实际进入缓冲的字节数。
    ///
    /// 不等待网络；放不下的尾部被丢弃并计入 `dropped_bytes`。
    pub fn send(&self, message: &[u8]) -> Result<usize> {
        let shared = &self.shared;
        if shared.closing.load(Ordering::Acquire) {
            return Err(StreamError::ShutDown);
        }
        if shared.state() == StreamState::Failed {
            return Err(StreamError::NotReachable {
                target: shared.config.target,
                attempts: shared.attempts.load(Ordering::Relaxed),
            });
        }

        let prefix = shared.config.prefix.as_deref().unwrap_or_default().as_bytes();
        let total = prefix.len() + message.len();
        let accepted = {
            let mut buffer = shared.buffer.lock();
            let room = shared.config.buffer_capacity.saturating_sub(buffer.len());
            let mut left = room;
            for part in [prefix, message] {
                let take = part.len().min(left);
                buffer.extend_from_slice(&part[..take]);
                left -= take;
            }
            room - left
        };
        if accepted < total {
            let lost = (total - accepted) as u64;
            shared.dropped_bytes.fetch_add(lost, Ordering::Relaxed);
            warn!(
                target_addr = %shared.config.target,
                lost,
                capacity = shared.config.buffer_capacity,
                "stream buffer full, messages are lost"
            );
        }
        shared.wake.notify_one();
        Ok(accepted)
    }

    /// 请求后台任务尽快写出缓冲，不等待结果。
    pub fn flush(&self) {
        self.shared.wake.notify_one();
    }

    /// 断开当前连接并立即重连；也用于从 `Failed` 恢复。
    pub fn reset(&self) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(StreamError::ShutDown);
        }
        self.shared.reset.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn status(&self) -> StreamStatus {
        let shared = &self.shared;
        StreamStatus {
            state: shared.state(),
            connect_count: shared.connect_count.load(Ordering::Relaxed),
            retry_count: shared.retry_count.load(Ordering::Relaxed),
            buffered_bytes: shared.buffer.lock().len(),
            dropped_bytes: shared.dropped_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == StreamState::Connected
    }

    /// 订阅状态变化。
    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    /// 停止接收新消息，在已有连接上写出剩余缓冲并等待后台任务退出。
    ///
    /// 超过 `shutdown_timeout` 时中止任务并返回 `Timeout`；重复调用直接返回。
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::Release);
        let Some(task) = self.task.lock().take() else {
            return Ok(());
        };
        self.shared.wake.notify_one();

        let after = self.shared.config.shutdown_timeout;
        let abort = task.abort_handle();
        match timeout(after, task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                abort.abort();
                warn!(
                    target_addr = %self.shared.config.target,
                    ?after,
                    "stream shutdown did not complete in time"
                );
                Err(StreamError::Timeout {
                    operation: "shutdown",
                    after,
                })
            }
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            self.shared.closing.store(true, Ordering::Release);
            task.abort();
        }
    }
}

/// 一轮等待结束的原因。
enum Wake {
    /// 对端发来数据、关闭或出错。
    Peer(io::Result<usize>),
    Signal,
    Tick,
}

async fn run(shared: Arc<Shared>, connector: Arc<dyn StreamConnector>) {
    let target = shared.config.target;
    let retry_interval = shared.config.retry_interval;
    let mut stream: Option<BoxedStream> = None;
    // 已交给内核、尚未确认送达的字节；连接失效时放回缓冲前端补发。
    let mut backlog = BytesMut::new();
    let mut last_write = Instant::now();
    let mut scratch = [0u8; 512];
    let mut ever_connected = false;
    let mut next_attempt = Instant::now();

    loop {
        let closing = shared.closing.load(Ordering::Acquire);

        if shared.reset.swap(false, Ordering::AcqRel) {
            if let Some(mut old) = stream.take() {
                let _ = old.shutdown().await;
            }
            backlog.clear();
            shared.attempts.store(0, Ordering::Relaxed);
            next_attempt = Instant::now();
            shared.set_state(StreamState::Disconnected);
            info!(target_addr = %target, "stream reset");
        }

        let due = Instant::now() >= next_attempt;
        if stream.is_none() && !closing && due && shared.state() != StreamState::Failed {
            shared.set_state(StreamState::Connecting);
            let outcome = match timeout(retry_interval, connector.connect(target)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
            };
            match outcome {
                Ok(connected) => {
                    stream = Some(connected);
                    ever_connected = true;
                    backlog.clear();
                    shared.attempts.store(0, Ordering::Relaxed);
                    let connects = shared.connect_count.fetch_add(1, Ordering::Relaxed) + 1;
                    shared.set_state(StreamState::Connected);
                    info!(target_addr = %target, connects, "stream connected");
                }
                Err(err) => {
                    let err = map_io_error(CONNECT, target, err);
                    let attempts = shared.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    shared.retry_count.fetch_add(1, Ordering::Relaxed);
                    next_attempt = Instant::now() + retry_interval;
                    let exhausted = !ever_connected
                        && shared
                            .config
                            .initial_attempts
                            .is_some_and(|limit| attempts >= limit);
                    if exhausted {
                        warn!(
                            code = err.code(),
                            error = %err,
                            attempts,
                            "stream target not reachable, waiting for reset"
                        );
                        shared.set_state(StreamState::Failed);
                    } else {
                        if attempts == 1 {
                            warn!(code = err.code(), error = %err, "stream connect failed, retrying");
                        } else {
                            debug!(code = err.code(), error = %err, attempts, "stream connect failed");
                        }
                        shared.set_state(StreamState::Disconnected);
                    }
                }
            }
        }

        if let Some(connected) = stream.as_mut() {
            match write_buffered(&shared, connected, &mut backlog, &mut scratch).await {
                Ok(true) => last_write = Instant::now(),
                Ok(false) => {}
                Err(err) => {
                    stream = None;
                    connection_lost(&shared, &mut backlog, err);
                    next_attempt = Instant::now() + retry_interval;
                }
            }
        }

        if closing {
            break;
        }

        let wake_at = if stream.is_none() && shared.state() != StreamState::Failed {
            next_attempt
        } else {
            Instant::now() + retry_interval
        };
        let wake = tokio::select! {
            biased;
            read = read_peer(stream.as_mut(), &mut scratch) => Wake::Peer(read),
            _ = shared.wake.notified() => Wake::Signal,
            _ = sleep_until(wake_at) => Wake::Tick,
        };
        match wake {
            Wake::Peer(Ok(discarded)) if discarded > 0 => {
                debug!(target_addr = %target, discarded, "ignoring bytes sent by stream peer");
            }
            Wake::Peer(read) => {
                stream = None;
                connection_lost(&shared, &mut backlog, read.err().unwrap_or_else(peer_closed));
                next_attempt = Instant::now() + retry_interval;
            }
            Wake::Signal => {}
            Wake::Tick => {
                // 写出后整整一个周期连接仍然完好，视为已送达。
                if stream.is_some() && last_write.elapsed() >= retry_interval {
                    backlog.clear();
                }
            }
        }
    }

    if let Some(mut connected) = stream.take() {
        let _ = connected.shutdown().await;
    }
    shared.set_state(StreamState::Disconnected);
    debug!(target_addr = %target, "stream task stopped");
}

fn peer_closed() -> io::Error {
    io::Error::from(io::ErrorKind::UnexpectedEof)
}

/// 读对端；没有连接时永不就绪。
async fn read_peer(stream: Option<&mut BoxedStream>, scratch: &mut [u8]) -> io::Result<usize> {
    match stream {
        Some(stream) => stream.read(scratch).await,
        None => std::future::pending().await,
    }
}

/// 连接失效：未确认的字节放回缓冲前端，放不下的尾部计入丢弃。
fn connection_lost(shared: &Shared, backlog: &mut BytesMut, err: io::Error) {
    let err = map_io_error(WRITE, shared.config.target, err);
    let capacity = shared.config.buffer_capacity;
    let requeued = backlog.len();
    let lost = {
        let mut buffer = shared.buffer.lock();
        let mut merged = BytesMut::with_capacity(capacity.max(requeued + buffer.len()));
        merged.extend_from_slice(backlog);
        merged.extend_from_slice(&buffer);
        let lost = merged.len().saturating_sub(capacity);
        merged.truncate(capacity);
        *buffer = merged;
        lost
    };
    backlog.clear();
    if lost > 0 {
        shared.dropped_bytes.fetch_add(lost as u64, Ordering::Relaxed);
        warn!(
            target_addr = %shared.config.target,
            lost,
            capacity,
            "stream buffer full while requeueing, messages are lost"
        );
    }
    warn!(
        code = err.code(),
        error = %err,
        requeued,
        buffered = shared.buffer.lock().len(),
        "stream connection lost, keeping data for resend"
    );
    shared.set_state(StreamState::Disconnected);
}

/// 把缓冲写到 `stream`，返回是否写出了数据。
///
/// 写之前先看一眼读方向，对端已关闭时不再写。写出的字节从缓冲移到 `backlog`，
/// `backlog` 只保留最近的 `buffer_capacity` 字节。
async fn write_buffered(
    shared: &Shared,
    stream: &mut BoxedStream,
    backlog: &mut BytesMut,
    scratch: &mut [u8],
) -> io::Result<bool> {
    if shared.buffer.lock().is_empty() {
        return Ok(false);
    }
    tokio::select! {
        biased;
        read = stream.read(scratch) => match read {
            Ok(0) => return Err(peer_closed()),
            Ok(_) => {}
            Err(err) => return Err(err),
        },
        _ = std::future::ready(()) => {}
    }

    let capacity = shared.config.buffer_capacity;
    loop {
        let pending = {
            let buffer = shared.buffer.lock();
            if buffer.is_empty() {
                break;
            }
            Bytes::copy_from_slice(&buffer)
        };
        let written = stream.write(&pending).await?;
        if written == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        shared.buffer.lock().advance(written);
        backlog.extend_from_slice(&pending[..written]);
        if backlog.len() > capacity {
            let excess = backlog.len() - capacity;
            backlog.advance(excess);
        }
    }
    stream.flush().await?;
    Ok(true)
}
