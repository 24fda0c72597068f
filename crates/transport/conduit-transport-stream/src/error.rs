#[cfg(feature = "tls")]
use std::io;

use conduit_core::error::OperationKind;
use thiserror::Error;

pub(crate) const REUNITE: OperationKind = OperationKind {
    code: "conduit.transport.stream.reunite_failed",
    message: "stream reunite",
};

#[cfg(feature = "tls")]
pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "conduit.transport.tls.handshake_failed",
    message: "tls handshake",
};

#[cfg(feature = "tls")]
pub(crate) const SERVER_NAME: OperationKind = OperationKind {
    code: "conduit.transport.tls.invalid_server_name",
    message: "tls server name",
};

/// 装配分层流时的失败。
#[derive(Debug, Error)]
pub enum StreamTransportError {
    #[error("{}: read and write halves come from different streams", REUNITE.message)]
    Mismatched,
}

impl StreamTransportError {
    pub fn code(&self) -> &'static str {
        match self {
            StreamTransportError::Mismatched => REUNITE.code,
        }
    }
}

/// TLS 升级失败。
///
/// # 契约（What）
/// - `Handshake`：握手阶段的 IO 或协议失败，`rustls` 的错误嵌套在 `io::Error` 内；
/// - `InvalidServerName`：客户端提供的 SNI 无法解析为合法主机名或 IP。
#[cfg(feature = "tls")]
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{}: {source}", HANDSHAKE.message)]
    Handshake {
        #[source]
        source: io::Error,
    },
    #[error("{}: `{name}` is not a valid DNS name or IP address", SERVER_NAME.message)]
    InvalidServerName { name: String },
}

#[cfg(feature = "tls")]
impl TlsError {
    pub fn code(&self) -> &'static str {
        match self {
            TlsError::Handshake { .. } => HANDSHAKE.code,
            TlsError::InvalidServerName { .. } => SERVER_NAME.code,
        }
    }

    /// 握手失败是否源自对端断连，而非证书或协议问题。
    pub fn is_disconnect(&self) -> bool {
        match self {
            TlsError::Handshake { source } => {
                conduit_core::classify_io_error(source) == conduit_core::IoDisposition::Ignorable
            }
            TlsError::InvalidServerName { .. } => false,
        }
    }
}

