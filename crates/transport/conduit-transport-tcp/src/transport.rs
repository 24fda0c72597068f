use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use conduit_core::{Endpoints, InputHalf, OutputHalf, Transport};
use socket2::SockRef;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::config::TcpSocketConfig;
use crate::error::{ADDRESS, CONNECT, TcpTransportError};
use crate::sender::SenderPool;

/// 原始 TCP 套接字上的传输。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为引擎提供最直接的流式传输：输入半部直接接收到引擎缓冲，输出半部以池化发送器做分散-聚集写入；
/// - 关闭时尽力执行 `shutdown(Both)`，让对端与本端的阻塞读都尽快观察到结束。
///
/// ## 逻辑（How）
/// - 构造时应用 [`TcpSocketConfig`] 并记录端点；
/// - [`Transport::into_halves`] 通过 `into_split` 得到可独立移动的读写半部，两者可在分离后经
///   [`reunite`] 合并回原始 `TcpStream`。
///
/// ## 契约（What）
/// - 端点均为 [`conduit_core::Endpoint::Socket`]；
/// - 关闭的 `shutdown` 受 CAS 保护，只执行一次，失败被忽略。
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    endpoints: Endpoints,
    pool: Arc<SenderPool>,
}

impl TcpTransport {
    /// 连接到 `addr` 并以默认配置装配。
    pub async fn connect(addr: SocketAddr) -> Result<Self, TcpTransportError> {
        Self::connect_with_config(addr, TcpSocketConfig::default()).await
    }

    pub async fn connect_with_config(
        addr: SocketAddr,
        config: TcpSocketConfig,
    ) -> Result<Self, TcpTransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|error| TcpTransportError::io(CONNECT, error))?;
        Self::from_stream(stream, &config)
    }

    /// 装配一个已建立的连接（通常来自外部监听器的 `accept`）。
    pub fn from_stream(stream: TcpStream, config: &TcpSocketConfig) -> Result<Self, TcpTransportError> {
        config.apply(&stream)?;
        let remote = stream
            .peer_addr()
            .map_err(|error| TcpTransportError::io(ADDRESS, error))?;
        let local = stream
            .local_addr()
            .map_err(|error| TcpTransportError::io(ADDRESS, error))?;
        Ok(Self {
            stream,
            endpoints: Endpoints::sockets(remote, local),
            pool: SenderPool::shared(),
        })
    }

    /// 使用指定的发送器池替代进程级默认池。
    pub fn with_pool(mut self, pool: Arc<SenderPool>) -> Self {
        self.pool = pool;
        self
    }
}

impl Transport for TcpTransport {
    type Input = TcpInput;
    type Output = TcpOutput;

    fn endpoints(&self) -> Endpoints {
        self.endpoints.clone()
    }

    fn into_halves(self) -> (TcpInput, TcpOutput) {
        let (reader, writer) = self.stream.into_split();
        (
            TcpInput { reader },
            TcpOutput {
                writer,
                pool: self.pool,
                closed: AtomicBool::new(false),
            },
        )
    }
}

/// TCP 输入半部：每次 `fill` 执行一次接收。
#[derive(Debug)]
pub struct TcpInput {
    reader: OwnedReadHalf,
}

#[async_trait]
impl InputHalf for TcpInput {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.reader.read_buf(buf).await
    }
}

/// TCP 输出半部：借用池化发送器做分散-聚集写入。
#[derive(Debug)]
pub struct TcpOutput {
    writer: OwnedWriteHalf,
    pool: Arc<SenderPool>,
    closed: AtomicBool,
}

#[async_trait]
impl OutputHalf for TcpOutput {
    async fn drain(&mut self, segments: &[Bytes]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let mut sender = self.pool.acquire();
        let result = sender.send(&mut self.writer, segments).await;
        self.pool.release(sender);
        result
    }

    async fn close(&mut self) -> io::Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let stream: &TcpStream = self.writer.as_ref();
        if let Err(error) = SockRef::from(stream).shutdown(Shutdown::Both) {
            tracing::debug!(error = %error, "best-effort tcp shutdown failed");
        }
        Ok(())
    }
}

/// 把分离后交还的两个半部合并回原始 `TcpStream`，供协议升级（如 TLS）继续使用。
///
/// 已关闭的输出半部无法再承载新协议，返回 `NotConnected`。
pub fn reunite(input: TcpInput, output: TcpOutput) -> Result<TcpStream, TcpTransportError> {
    if output.closed.load(Ordering::Acquire) {
        return Err(TcpTransportError::io(
            crate::error::REUNITE,
            io::Error::from(io::ErrorKind::NotConnected),
        ));
    }
    input
        .reader
        .reunite(output.writer)
        .map_err(|_| TcpTransportError::Mismatched)
}
