#![deny(unsafe_code)]

//! `conduit-transport-stream` 把任意 `AsyncRead + AsyncWrite` 流接入 `conduit-core` 引擎。
//!
//! # 教案背景（Why）
//! - 分层流（TLS、压缩、进程管道、内存双工流）没有可直接操作的套接字，只能以顺序写入加冲刷的方式发送；
//! - TLS 是其中最常见的一种，启用 `tls` 特性后提供服务端/客户端握手入口与对端证书暴露。
//!
//! # 使用概览（How）
//! - [`StreamTransport::new`] 接受任意流与调用方提供的端点；
//! - `tls` 特性：`TlsUpgrader::accept` / `TlsConnector::connect` 在握手后直接产出传输与 `TlsSessionInfo`。
//!
//! # 风险提示（Trade-offs）
//! - 每次 `drain` 都会 `flush`，TLS 下每批分段至少形成一条记录；高频小包场景应使用管道写模式以便批量合并。

mod error;
mod stream;
#[cfg(feature = "tls")]
mod tls;

#[cfg(feature = "tls")]
pub use crate::error::TlsError;
pub use crate::error::StreamTransportError;
pub use crate::stream::{StreamInput, StreamOutput, StreamTransport, reunite};
#[cfg(feature = "tls")]
pub use crate::tls::{
    ClientTlsTransport, ServerTlsTransport, TlsConnector, TlsSessionInfo, TlsUpgrader,
};

/// 分层流上的引擎别名。
pub type StreamConnection<S> = conduit_core::PipeConnection<StreamInput<S>, StreamOutput<S>>;
