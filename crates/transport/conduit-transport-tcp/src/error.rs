use std::io;

use conduit_core::error::OperationKind;
use thiserror::Error;

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "conduit.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "conduit.transport.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const ADDRESS: OperationKind = OperationKind {
    code: "conduit.transport.tcp.address_failed",
    message: "tcp address lookup",
};
pub(crate) const REUNITE: OperationKind = OperationKind {
    code: "conduit.transport.tcp.reunite_failed",
    message: "tcp reunite",
};

/// 建立或装配 TCP 传输时的失败。
///
/// 运行期的收发故障由引擎按 IO 分类处理，不经过本类型。
#[derive(Debug, Error)]
pub enum TcpTransportError {
    #[error("{}: {source}", op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("{}: read and write halves belong to different sockets", REUNITE.message)]
    Mismatched,
}

impl TcpTransportError {
    pub(crate) fn io(op: OperationKind, source: io::Error) -> Self {
        TcpTransportError::Io { op, source }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TcpTransportError::Io { op, .. } => op.code,
            TcpTransportError::Mismatched => REUNITE.code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_operation() {
        let error = TcpTransportError::io(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(error.code(), "conduit.transport.tcp.connect_failed");
        assert!(error.to_string().starts_with("tcp connect: "));
        assert_eq!(TcpTransportError::Mismatched.code(), REUNITE.code);
    }
}
