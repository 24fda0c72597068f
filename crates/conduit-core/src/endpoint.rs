use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;

/// `Endpoint` 在 TCP、UDP、TLS 与内存通道之间提供统一的端点表达。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接的身份由“远端/本端端点对”确定，而内存通道、控制台管道等并没有套接字地址；
/// - 统一为枚举后，引擎与会话层无需关心具体传输即可记录日志或做路由。
///
/// ## 契约（What）
/// - `Socket` 承载真实网络地址；`Named` 承载任意可读名称（如 `"memory:peer-1"`）；
/// - `Display` 输出稳定字符串，适合作为日志字段。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Endpoint {
    /// 网络套接字地址。
    Socket(SocketAddr),
    /// 非网络端点的可读名称。
    Named(Cow<'static, str>),
}

impl Endpoint {
    /// 以静态名称构造非网络端点。
    pub const fn named(name: &'static str) -> Self {
        Endpoint::Named(Cow::Borrowed(name))
    }

    /// 若为网络端点则返回套接字地址。
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Socket(addr) => Some(*addr),
            Endpoint::Named(_) => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Socket(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Socket(addr) => write!(f, "{addr}"),
            Endpoint::Named(name) => f.write_str(name),
        }
    }
}

/// 一条连接的端点对；任一侧都可能未知。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub remote: Option<Endpoint>,
    pub local: Option<Endpoint>,
}

impl Endpoints {
    pub fn new(remote: impl Into<Option<Endpoint>>, local: impl Into<Option<Endpoint>>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
        }
    }

    /// 由套接字地址对构造。
    pub fn sockets(remote: SocketAddr, local: SocketAddr) -> Self {
        Self::new(Endpoint::Socket(remote), Endpoint::Socket(local))
    }
}
