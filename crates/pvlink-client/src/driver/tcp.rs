//! 基于 Tokio 的 Circuit 连接执行者。
//!
//! # 教案式说明
//! - **意图 (Why)**：把 [`Connector`] 的三个请求落到真实套接字上。每个 `(circuit, epoch)`
//!   对应一个任务，任务的全部结局都经由 [`CircuitLink`] 交还给上下文，由状态机决定后续。
//! - **流程 (How)**：
//!   1. 在 `connection_timeout` 内建连并完成握手（发送版本、客户端名、主机名，等待服务器版本）；
//!   2. 回报 `connected`，进入读写循环：解码缓冲区内的完整帧逐条上报，随后刷新发送队列；
//!   3. `select!` 同时等待可读与唤醒通知；
//!   4. EOF 回报 `closed`，读写或解码失败回报 `failed`。
//! - **契约 (What)**：
//!   - `close` 只终止 epoch 匹配的任务；任务被终止时不再回报任何事件；
//!   - 发送端只获取逐 Circuit 锁取走报文，从不触碰上下文的全局锁。

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use pvlink_core::error::{CONFIGURE, CONNECT, OperationKind, READ, WRITE, map_io_error};
use pvlink_core::wire::{FrameCodec, MINOR_VERSION, Message};
use pvlink_core::{CaError, ClientConfig, Result};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::ids::CircuitId;
use crate::io::{CircuitLink, Connector};

const READ_BUFFER: usize = 16 * 1024;

#[derive(Clone, Debug)]
struct SessionSettings {
    connect_timeout: Duration,
    max_array_bytes: usize,
    client_name: String,
    host_name: String,
}

struct CircuitTask {
    epoch: u64,
    wake: Arc<Notify>,
    abort: AbortHandle,
}

/// 每个 Circuit epoch 一个 Tokio 任务的连接执行者。
pub struct TcpConnector {
    runtime: Handle,
    settings: SessionSettings,
    tasks: Mutex<HashMap<CircuitId, CircuitTask>>,
}

impl TcpConnector {
    pub fn new(config: &ClientConfig, runtime: Handle) -> Self {
        Self {
            runtime,
            settings: SessionSettings {
                connect_timeout: config.connection_timeout,
                max_array_bytes: config.max_array_bytes,
                client_name: config.client_name.clone(),
                host_name: config.host_name.clone(),
            },
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// 仍在运行的连接任务数。
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|task| !task.abort.is_finished())
            .count()
    }
}

impl Connector for TcpConnector {
    fn open(&self, link: CircuitLink) {
        let wake = Arc::new(Notify::new());
        let session = Session {
            link: link.clone(),
            wake: Arc::clone(&wake),
            settings: self.settings.clone(),
        };
        let handle = self.runtime.spawn(session.run());
        let task = CircuitTask {
            epoch: link.epoch(),
            wake,
            abort: handle.abort_handle(),
        };
        if let Some(previous) = self.tasks.lock().insert(link.circuit(), task) {
            previous.abort.abort();
        }
    }

    fn wake(&self, circuit: CircuitId) {
        if let Some(task) = self.tasks.lock().get(&circuit) {
            task.wake.notify_one();
        }
    }

    fn close(&self, circuit: CircuitId, epoch: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(&circuit).is_some_and(|task| task.epoch == epoch) {
            if let Some(task) = tasks.remove(&circuit) {
                task.abort.abort();
                debug!(circuit = %circuit, epoch, "circuit task stopped");
            }
        }
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.abort.abort();
        }
    }
}

/// 在截止时间内执行一次 I/O，并把超时映射为 `Timeout`。
async fn with_deadline<T>(
    kind: OperationKind,
    peer: SocketAddr,
    timeout: Duration,
    future: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(|err| map_io_error(kind, Some(peer), err)),
        Err(_) => Err(CaError::Timeout {
            operation: kind.message,
            after: timeout,
        }),
    }
}

struct Session {
    link: CircuitLink,
    wake: Arc<Notify>,
    settings: SessionSettings,
}

impl Session {
    async fn run(self) {
        let peer = self.link.addr();
        match self.drive().await {
            Ok(()) => {
                info!(%peer, epoch = self.link.epoch(), "peer closed circuit");
                self.link.closed();
            }
            Err(err) => self.link.failed(err),
        }
    }

    async fn drive(&self) -> Result<()> {
        let peer = self.link.addr();
        let codec = FrameCodec::client(self.settings.max_array_bytes);
        let mut stream = with_deadline(
            CONNECT,
            peer,
            self.settings.connect_timeout,
            TcpStream::connect(peer),
        )
        .await?;
        configure(&stream).map_err(|err| map_io_error(CONFIGURE, Some(peer), err))?;

        let mut inbound = BytesMut::with_capacity(READ_BUFFER);
        let mut outbound = BytesMut::new();
        let handshake = self.handshake(&codec, &mut stream, &mut inbound, &mut outbound);
        match tokio::time::timeout(self.settings.connect_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CaError::Timeout {
                    operation: "handshake",
                    after: self.settings.connect_timeout,
                });
            }
        }
        self.link.connected();

        loop {
            while let Some(message) = codec.decode(&mut inbound)? {
                self.link.message(message);
            }
            if !self.link.is_current() {
                return Ok(());
            }
            self.flush(&codec, &mut stream, &mut outbound).await?;
            tokio::select! {
                read = stream.read_buf(&mut inbound) => {
                    let n = read.map_err(|err| map_io_error(READ, Some(peer), err))?;
                    if n == 0 {
                        return Ok(());
                    }
                }
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn handshake(
        &self,
        codec: &FrameCodec,
        stream: &mut TcpStream,
        inbound: &mut BytesMut,
        outbound: &mut BytesMut,
    ) -> Result<()> {
        let peer = self.link.addr();
        let greeting = [
            Message::Version {
                priority: 0,
                minor: MINOR_VERSION,
            },
            Message::ClientName {
                name: self.settings.client_name.clone(),
            },
            Message::HostName {
                name: self.settings.host_name.clone(),
            },
        ];
        outbound.clear();
        for message in &greeting {
            codec.encode(message, outbound)?;
        }
        stream
            .write_all(outbound)
            .await
            .map_err(|err| map_io_error(WRITE, Some(peer), err))?;

        loop {
            match codec.decode(inbound)? {
                Some(Message::Version { minor, .. }) => {
                    debug!(%peer, minor, "server version received");
                    return Ok(());
                }
                Some(other) => {
                    return Err(CaError::protocol(
                        Some(peer),
                        format!("expected version during handshake, got {}", other.name()),
                    ));
                }
                None => {}
            }
            let n = stream
                .read_buf(inbound)
                .await
                .map_err(|err| map_io_error(READ, Some(peer), err))?;
            if n == 0 {
                return Err(CaError::protocol(Some(peer), "connection closed during handshake"));
            }
        }
    }

    async fn flush(
        &self,
        codec: &FrameCodec,
        stream: &mut TcpStream,
        outbound: &mut BytesMut,
    ) -> Result<()> {
        let pending = self.link.take_outbound();
        if pending.is_empty() {
            return Ok(());
        }
        outbound.clear();
        for message in &pending {
            codec.encode(message, outbound)?;
        }
        stream
            .write_all(outbound)
            .await
            .map_err(|err| map_io_error(WRITE, Some(self.link.addr()), err))?;
        debug!(peer = %self.link.addr(), frames = pending.len(), "flushed outbound frames");
        Ok(())
    }
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)
}
