#![deny(unsafe_code)]

//! `conduit-transport-tcp` 把原始 TCP 套接字接入 `conduit-core` 引擎。
//!
//! # 教案背景（Why）
//! - 原始套接字是吞吐最高的传输：接收直接写入引擎缓冲，发送以 `write_vectored` 一次提交多个分段；
//! - 监听与 `accept` 循环由宿主负责，本 crate 只装配已建立的连接。
//!
//! # 使用概览（How）
//! ```no_run
//! # async fn demo(stream: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
//! use conduit_core::{ConnectionOptions, PipeConnection};
//! use conduit_transport_tcp::{TcpSocketConfig, TcpTransport};
//!
//! let transport = TcpTransport::from_stream(stream, &TcpSocketConfig::default())?;
//! let connection = PipeConnection::new(transport, ConnectionOptions::default());
//! # let _ = connection;
//! # Ok(())
//! # }
//! ```
//!
//! # 风险提示（Trade-offs）
//! - 关闭时的 `shutdown(Both)` 会丢弃内核接收缓冲中尚未读取的数据。

mod config;
mod error;
mod sender;
mod transport;

pub use crate::config::TcpSocketConfig;
pub use crate::error::TcpTransportError;
pub use crate::sender::{DEFAULT_RETAINED_SENDERS, MAX_IO_SLICES, SenderPool, SocketSender};
pub use crate::transport::{TcpInput, TcpOutput, TcpTransport, reunite};

/// TCP 传输上的引擎别名。
pub type TcpConnection = conduit_core::PipeConnection<TcpInput, TcpOutput>;
