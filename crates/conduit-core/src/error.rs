use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::close::CloseReason;
use crate::encoder::EncodeError;
use crate::filter::FilterError;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const FILL: OperationKind = OperationKind {
    code: "conduit.transport.fill_failed",
    message: "transport fill",
};
pub const DRAIN: OperationKind = OperationKind {
    code: "conduit.transport.drain_failed",
    message: "transport drain",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "conduit.transport.shutdown_failed",
    message: "transport shutdown",
};

const TIMEOUT_CODE: &str = "conduit.transport.timeout";

/// IO 故障的处置分类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 断连类故障在长连接服务中极其常见，若逐一记录会淹没真正的异常；
/// - 将“是否可忽略”与“映射为哪种关闭原因”集中在一处，适配器之间的失败语义才能保持一致。
///
/// ## 契约（What）
/// - `Ignorable`：映射为 [`CloseReason::RemoteClosing`]，不写日志；
/// - `Socket`：映射为 [`CloseReason::SocketError`]，写 `error` 日志；
/// - `Application`：分层流（TLS 等）报告的数据/协议类故障，映射为 [`CloseReason::ApplicationError`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDisposition {
    Ignorable,
    Socket,
    Application,
}

impl IoDisposition {
    pub const fn close_reason(self) -> CloseReason {
        match self {
            IoDisposition::Ignorable => CloseReason::RemoteClosing,
            IoDisposition::Socket => CloseReason::SocketError,
            IoDisposition::Application => CloseReason::ApplicationError,
        }
    }
}

/// 默认的 IO 故障分类器，传输半部可在 `classify` 中覆写。
pub fn classify_io_error(error: &io::Error) -> IoDisposition {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::NotConnected
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::UnexpectedEof => IoDisposition::Ignorable,
        ErrorKind::InvalidData
        | ErrorKind::InvalidInput
        | ErrorKind::Unsupported
        | ErrorKind::Other => IoDisposition::Application,
        _ => IoDisposition::Socket,
    }
}

/// 连接引擎对外暴露的错误。
///
/// # 契约（What）
/// - 每个变体都有稳定的 [`code`](ConnectionError::code)，以及映射到关闭原因的
///   [`close_reason`](ConnectionError::close_reason)；
/// - 关闭后的任何发送都返回 `Closed`，绝不静默丢弃数据。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("connection is closed ({reason})")]
    Closed { reason: CloseReason },
    #[error("connection has been detached from its transport")]
    Detached,
    #[error("connection loop has already been started")]
    AlreadyStarted,
    #[error("pipeline filter failed: {0}")]
    Filter(#[from] FilterError),
    #[error("package of {length} bytes exceeds the limit of {limit} bytes")]
    PackageTooLarge { length: usize, limit: usize },
    #[error("pipeline filter made no progress after {steps} steps")]
    Stalled { steps: usize },
    #[error("failed to encode package: {0}")]
    Encode(#[from] EncodeError),
    #[error("{}: {source}", op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("{} timed out after {after:?}", op.message)]
    Timeout { op: OperationKind, after: Duration },
    #[error("package consumer has been dropped")]
    ConsumerGone,
    #[error("internal failure: {0}")]
    Internal(String),
}

impl ConnectionError {
    pub(crate) fn io(op: OperationKind, source: io::Error) -> Self {
        ConnectionError::Io { op, source }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionError::Closed { .. } => "conduit.connection.closed",
            ConnectionError::Detached => "conduit.connection.detached",
            ConnectionError::AlreadyStarted => "conduit.connection.already_started",
            ConnectionError::Filter(_) => "conduit.protocol.filter_failed",
            ConnectionError::PackageTooLarge { .. } => "conduit.protocol.package_too_large",
            ConnectionError::Stalled { .. } => "conduit.protocol.filter_stalled",
            ConnectionError::Encode(_) => "conduit.application.encode_failed",
            ConnectionError::Io { op, .. } => op.code,
            ConnectionError::Timeout { .. } => TIMEOUT_CODE,
            ConnectionError::ConsumerGone => "conduit.connection.consumer_gone",
            ConnectionError::Internal(_) => "conduit.connection.internal",
        }
    }

    /// 若该错误导致连接关闭，应记录的关闭原因。
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ConnectionError::Closed { reason } => *reason,
            ConnectionError::Filter(_)
            | ConnectionError::PackageTooLarge { .. }
            | ConnectionError::Stalled { .. } => CloseReason::ProtocolError,
            ConnectionError::Io { source, .. } => classify_io_error(source).close_reason(),
            ConnectionError::Timeout { .. } => CloseReason::TimeOut,
            ConnectionError::ConsumerGone => CloseReason::LocalClosing,
            ConnectionError::Internal(_) => CloseReason::InternalError,
            ConnectionError::Detached
            | ConnectionError::AlreadyStarted
            | ConnectionError::Encode(_) => CloseReason::ApplicationError,
        }
    }
}
