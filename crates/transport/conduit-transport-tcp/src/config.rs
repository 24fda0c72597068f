use std::time::Duration;

use socket2::SockRef;
use tokio::net::TcpStream;

use crate::error::{CONFIGURE, TcpTransportError};

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `TCP_NODELAY`、`SO_LINGER` 等内核选项集中在一处显式配置，避免调用方直接操作 `socket2`；
/// - 请求-响应类协议的小包对延迟敏感，默认关闭 Nagle 算法。
///
/// ## 契约（What）
/// - `nodelay`：是否禁用 Nagle，默认 `true`；
/// - `linger`：`Some(dur)` 时关闭阶段在 `dur` 后仍未发完即发送 RST，`None` 沿用内核默认；
/// - **后置条件**：[`apply`](TcpSocketConfig::apply) 返回 `Ok(())` 时选项已落地。
///
/// ## 注意事项（Trade-offs）
/// - Linux 会把 `linger` 向下取整到秒。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> Result<(), TcpTransportError> {
        stream
            .set_nodelay(self.nodelay)
            .map_err(|error| TcpTransportError::io(CONFIGURE, error))?;
        if self.linger.is_some() {
            SockRef::from(stream)
                .set_linger(self.linger)
                .map_err(|error| TcpTransportError::io(CONFIGURE, error))?;
        }
        Ok(())
    }
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}
