use core::fmt;

use serde::Deserialize;

/// `CloseReason` 描述连接终止的根因，是会话层唯一可观测的关闭分类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“为什么断开”收敛为有限枚举，使日志、告警与会话层策略能够基于稳定取值分支；
/// - 关闭原因只允许写入一次（先写者胜出），因此枚举本身需要 `Copy` 以便在多任务间廉价传递。
///
/// ## 契约（What）
/// - `Unknown` 为缺省值：若生命周期结束时无人记录原因，`closed` 通知携带该值；
/// - `RemoteClosing` 同时覆盖“对端优雅关闭”与“可忽略的传输故障”（复位、中止、超时等）；
/// - `ProtocolError` 仅由过滤器失败或长度守卫触发，永不重试。
///
/// ## 风险（Trade-offs）
/// - 枚举标记 `non_exhaustive`，新增取值不会破坏下游匹配，但下游必须提供兜底分支。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum CloseReason {
    /// 未记录原因。
    #[default]
    Unknown,
    /// 宿主正在停机。
    ServerShutdown,
    /// 对端关闭或出现可忽略的断连类故障。
    RemoteClosing,
    /// 本端主动关闭。
    LocalClosing,
    /// 应用层或分层流（如 TLS）抛出的非套接字故障。
    ApplicationError,
    /// 不可忽略的套接字故障。
    SocketError,
    /// 收发超时。
    TimeOut,
    /// 协议违规：过滤器失败或包长度越界。
    ProtocolError,
    /// 引擎内部故障，例如读取任务崩溃。
    InternalError,
    /// 会话层拒绝了该连接。
    Rejected,
}

impl CloseReason {
    /// 稳定的蛇形命名，便于日志字段与配置文件引用。
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unknown => "unknown",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::RemoteClosing => "remote_closing",
            CloseReason::LocalClosing => "local_closing",
            CloseReason::ApplicationError => "application_error",
            CloseReason::SocketError => "socket_error",
            CloseReason::TimeOut => "time_out",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::InternalError => "internal_error",
            CloseReason::Rejected => "rejected",
        }
    }

    /// 是否属于需要记录诊断日志的故障类原因。
    pub const fn is_fault(&self) -> bool {
        matches!(
            self,
            CloseReason::ApplicationError
                | CloseReason::SocketError
                | CloseReason::TimeOut
                | CloseReason::ProtocolError
                | CloseReason::InternalError
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
