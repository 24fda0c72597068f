use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::close::CloseReason;
use crate::endpoint::Endpoint;
use crate::error::ConnectionError;
use crate::state::ConnectionState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的连接编号，仅用于日志关联。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 会话层看到的连接契约，与具体传输、包类型无关。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话容器通常以 `Arc<dyn Connection>` 统一持有不同传输上的连接，因此契约必须对象安全；
/// - 泛型能力（运行过滤器、编码结构化包、分离）留在具体引擎类型上，契约只暴露身份、状态、
///   原始字节发送与关闭。
///
/// ## 契约（What）
/// - `closed` 在连接生命周期内恰好完成一次并携带原因；已分离的连接永不完成；
/// - `send` 在连接关闭后立即失败；
/// - `close` 等待读取循环完全退出后才返回，之后传输上不再发生任何 IO。
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn state(&self) -> ConnectionState;

    fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    fn remote_endpoint(&self) -> Option<&Endpoint>;

    fn local_endpoint(&self) -> Option<&Endpoint>;

    fn last_active_time(&self) -> SystemTime;

    fn close_reason(&self) -> Option<CloseReason>;

    async fn send(&self, data: Bytes) -> Result<(), ConnectionError>;

    async fn close(&self, reason: CloseReason) -> Result<(), ConnectionError>;

    async fn closed(&self) -> CloseReason;
}
