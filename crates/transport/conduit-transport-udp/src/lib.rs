#![deny(unsafe_code)]
#![doc = r#"
# conduit-transport-udp

## 模块使命（Why）
- **无连接的连接**：UDP 没有连续字节流，宿主的监听循环按来源地址把数据报分发给各自的连接；
  本 crate 让每个对端都拥有一个普通的 `PipeConnection`，上层会话无需感知传输差异。
- **绕过通用写路径**：数据报没有面向连接的缓冲可以利用，额外排队只会增加丢包与乱序暴露面，
  因此默认每次发送都在写锁内立即 `send_to`。

## 核心契约（What）
- `UdpTransport::new` 返回传输与 `DatagramFeeder`；监听循环每收到一个数据报就调用一次 `push`，
  引擎的每次 `fill` 恰好交付一个数据报；
- `DatagramFeeder::complete` 结束输入，连接以远端关闭收尾；
- 写模式：`values` 中 `enableSendingPipe` 为 `true` 时走管道写模式，否则直接发送；
  两种模式下，同一次 `drain` 的全部分段都合并为**一个**数据报。

## 实现策略（How）
- 输入半部复用核心的 `VirtualInput`（以数据块为单位的内存输入）；
- 输出半部共享监听套接字，关闭时不关闭套接字，套接字的生命周期归宿主所有。
"#]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use conduit_core::error::OperationKind;
use conduit_core::{
    BlockSender, ConnectionOptions, Endpoints, OutputHalf, PipeConnection, Transport, VirtualInput,
    WriteMode,
};
use thiserror::Error;
use tokio::net::UdpSocket;

/// 打开管道写模式的配置键。
pub const ENABLE_SENDING_PIPE: &str = "enableSendingPipe";

const ADDRESS: OperationKind = OperationKind {
    code: "conduit.transport.udp.address_failed",
    message: "udp address lookup",
};

/// 装配数据报传输时的失败。
#[derive(Debug, Error)]
pub enum UdpTransportError {
    #[error("{}: {source}", op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },
}

impl UdpTransportError {
    pub fn code(&self) -> &'static str {
        match self {
            UdpTransportError::Io { op, .. } => op.code,
        }
    }
}

/// 监听循环持有的输入端：每次 `push` 对应引擎的一次 `fill`。
#[derive(Clone, Debug)]
pub struct DatagramFeeder {
    sender: Option<BlockSender>,
}

impl DatagramFeeder {
    /// 投递一个收到的数据报；连接已结束时返回 `BrokenPipe`，监听循环可据此清理路由表。
    pub fn push(&self, datagram: impl Into<Bytes>) -> io::Result<()> {
        match &self.sender {
            Some(sender) => sender.write(datagram),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// 结束本句柄的输入；所有克隆都结束后引擎观察到输入结束。
    pub fn complete(&mut self) {
        self.sender = None;
    }

    /// 引擎侧是否已不再接收数据报。
    pub fn is_closed(&self) -> bool {
        self.sender.as_ref().is_none_or(BlockSender::is_closed)
    }
}

/// 单个对端的数据报传输。
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    input: VirtualInput,
    endpoints: Endpoints,
}

impl UdpTransport {
    /// 以共享的监听套接字与对端地址构造传输。
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> Result<(Self, DatagramFeeder), UdpTransportError> {
        let local = socket
            .local_addr()
            .map_err(|source| UdpTransportError::Io { op: ADDRESS, source })?;
        let (sender, input) = VirtualInput::channel();
        let transport = Self {
            socket,
            peer,
            input,
            endpoints: Endpoints::sockets(peer, local),
        };
        Ok((
            transport,
            DatagramFeeder {
                sender: Some(sender),
            },
        ))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for UdpTransport {
    type Input = VirtualInput;
    type Output = UdpOutput;

    fn endpoints(&self) -> Endpoints {
        self.endpoints.clone()
    }

    fn into_halves(self) -> (VirtualInput, UdpOutput) {
        (
            self.input,
            UdpOutput {
                socket: self.socket,
                peer: self.peer,
                scratch: BytesMut::new(),
            },
        )
    }
}

/// 数据报输出半部：每次 `drain` 发送恰好一个数据报。
#[derive(Debug)]
pub struct UdpOutput {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    scratch: BytesMut,
}

#[async_trait]
impl OutputHalf for UdpOutput {
    async fn drain(&mut self, segments: &[Bytes]) -> io::Result<usize> {
        match segments {
            [] => Ok(0),
            [datagram] => self.socket.send_to(datagram, self.peer).await,
            _ => {
                self.scratch.clear();
                for segment in segments {
                    self.scratch.extend_from_slice(segment);
                }
                self.socket.send_to(&self.scratch, self.peer).await
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.scratch = BytesMut::new();
        Ok(())
    }

    fn write_mode(&self, options: &ConnectionOptions) -> WriteMode {
        if options.value_flag(ENABLE_SENDING_PIPE) == Some(true) {
            WriteMode::Piped
        } else {
            WriteMode::Direct
        }
    }
}

/// 数据报传输上的引擎别名。
pub type UdpConnection = PipeConnection<VirtualInput, UdpOutput>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn output(options: &ConnectionOptions) -> WriteMode {
        let socket = Arc::new(
            UdpSocket::bind("127.0.0.1:0")
                .await
                .expect("bind loopback socket"),
        );
        let peer = socket.local_addr().expect("local addr");
        let (transport, _feeder) = UdpTransport::new(socket, peer).expect("transport");
        let (_, output) = transport.into_halves();
        output.write_mode(options)
    }

    #[tokio::test]
    async fn direct_mode_is_the_default() {
        assert_eq!(output(&ConnectionOptions::default()).await, WriteMode::Direct);
        let disabled = ConnectionOptions::builder()
            .value(ENABLE_SENDING_PIPE, "false")
            .build()
            .expect("options");
        assert_eq!(output(&disabled).await, WriteMode::Direct);
    }

    #[tokio::test]
    async fn sending_pipe_flag_enables_piped_mode() {
        let enabled = ConnectionOptions::builder()
            .value(ENABLE_SENDING_PIPE, "True")
            .build()
            .expect("options");
        assert_eq!(output(&enabled).await, WriteMode::Piped);
    }

    #[test]
    fn completed_feeder_rejects_datagrams() {
        let (sender, _input) = VirtualInput::channel();
        let mut feeder = DatagramFeeder {
            sender: Some(sender),
        };
        assert!(!feeder.is_closed());
        feeder.complete();
        assert!(feeder.is_closed());
        assert_eq!(
            feeder.push(&b"late"[..]).expect_err("completed").kind(),
            io::ErrorKind::NotConnected
        );
    }
}
