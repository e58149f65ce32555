//! UDP 名称搜索。
//!
//! 每个数据报以一帧版本报文开头，随后尽量多地打包查询帧，单个数据报不超过
//! [`MAX_DATAGRAM`] 字节。应答由接收任务解码后交给上下文；服务器地址为
//! “未指定”时替换为数据报来源地址。

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pvlink_core::error::{BIND, CONFIGURE, SEARCH, map_io_error};
use pvlink_core::wire::{FrameCodec, MINOR_VERSION, Message};
use pvlink_core::{ClientConfig, Result};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::WeakContext;
use crate::io::{SearchRequest, SearchTransport};

/// 单个搜索数据报的上限。
pub const MAX_DATAGRAM: usize = 1024;

const RECV_BUFFER: usize = 64 * 1024;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct UdpSearchTransport {
    socket: Arc<UdpSocket>,
    destinations: Vec<SocketAddr>,
    codec: FrameCodec,
    prefix: Bytes,
}

impl UdpSearchTransport {
    /// 绑定本地临时端口。`auto_discovery` 打开时允许广播。
    pub async fn bind(config: &ClientConfig) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|err| map_io_error(BIND, None, err))?;
        let mut destinations = config.server_addresses.clone();
        if config.auto_discovery {
            socket
                .set_broadcast(true)
                .map_err(|err| map_io_error(CONFIGURE, None, err))?;
            destinations.push(SocketAddr::from((Ipv4Addr::BROADCAST, config.broadcast_port)));
        }
        let codec = FrameCodec::client(config.max_array_bytes);
        let mut prefix = BytesMut::new();
        codec.encode(
            &Message::Version {
                priority: 0,
                minor: MINOR_VERSION,
            },
            &mut prefix,
        )?;
        debug!(destinations = ?destinations, "search socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            destinations,
            codec,
            prefix: prefix.freeze(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|err| map_io_error(BIND, None, err))
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        &self.destinations
    }

    /// 把一批查询切分为数据报。
    fn datagrams(&self, requests: &[SearchRequest]) -> Vec<Bytes> {
        let mut datagrams = Vec::new();
        let mut current = BytesMut::from(&self.prefix[..]);
        let mut frame = BytesMut::new();
        for request in requests {
            frame.clear();
            let search = Message::Search {
                search_id: request.search_id,
                name: request.name.to_string(),
                reply_wanted: false,
            };
            if let Err(err) = self.codec.encode(&search, &mut frame) {
                warn!(name = %request.name, error = %err, "cannot encode search");
                continue;
            }
            if current.len() + frame.len() > MAX_DATAGRAM && current.len() > self.prefix.len() {
                datagrams.push(current.split().freeze());
                current.extend_from_slice(&self.prefix);
            }
            current.extend_from_slice(&frame);
        }
        if current.len() > self.prefix.len() {
            datagrams.push(current.freeze());
        }
        datagrams
    }

    /// 启动应答接收任务；上下文释放后任务退出。
    pub fn spawn_receiver(&self, runtime: &Handle, context: WeakContext) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let codec = self.codec.clone();
        runtime.spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %map_io_error(SEARCH, None, err), "search receive failed");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        continue;
                    }
                };
                let Some(context) = context.upgrade() else {
                    break;
                };
                let mut frames = BytesMut::from(&buf[..n]);
                loop {
                    match codec.decode(&mut frames) {
                        Ok(Some(Message::SearchReply { search_id, server })) => {
                            context.on_search_reply(search_id, reply_address(server, from));
                        }
                        Ok(Some(Message::Beacon { beacon_id, server })) => {
                            context.on_beacon(reply_address(server, from), beacon_id);
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(err) => {
                            debug!(%from, error = %err, "discarding malformed datagram");
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl SearchTransport for UdpSearchTransport {
    fn send(&self, requests: &[SearchRequest]) {
        for datagram in self.datagrams(requests) {
            for destination in &self.destinations {
                if let Err(err) = self.socket.try_send_to(&datagram, *destination) {
                    warn!(
                        %destination,
                        error = %map_io_error(SEARCH, Some(*destination), err),
                        "search datagram dropped"
                    );
                }
            }
        }
    }
}

fn reply_address(server: SocketAddrV4, from: SocketAddr) -> SocketAddr {
    if server.ip().is_unspecified() {
        SocketAddr::new(from.ip(), server.port())
    } else {
        SocketAddr::V4(server)
    }
}
