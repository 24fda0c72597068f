//! TLS 升级：把任意字节流包装为 TLS 流后交给 [`StreamTransport`]。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - TLS 是最常见的分层流，握手完成后读写语义与普通流一致，因此直接复用流式适配器；
//! - 证书轮换不应重启监听，服务端配置通过 [`ArcSwap`] 无锁热替换。
//!
//! ## 契约（What）
//! - 握手成功后返回传输与 [`TlsSessionInfo`]；会话信息是握手时刻的快照；
//! - 握手失败不产生传输，调用方自行决定是否关闭底层连接。
//!
//! ## 风险与权衡（Trade-offs）
//! - 握手本身没有超时，调用方应以 `tokio::time::timeout` 包裹 `accept`/`connect`。

use std::sync::Arc;

use arc_swap::ArcSwap;
use conduit_core::Endpoints;
use rustls::{ClientConfig, CommonState, ProtocolVersion, ServerConfig};
use rustls_pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server};

use crate::error::TlsError;
use crate::stream::StreamTransport;

/// 服务端 TLS 流上的传输。
pub type ServerTlsTransport<IO> = StreamTransport<server::TlsStream<IO>>;

/// 客户端 TLS 流上的传输。
pub type ClientTlsTransport<IO> = StreamTransport<client::TlsStream<IO>>;

/// 握手完成时协商出的会话信息。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSessionInfo {
    peer_certificates: Vec<CertificateDer<'static>>,
    server_name: Option<String>,
    alpn_protocol: Option<Vec<u8>>,
    protocol_version: Option<ProtocolVersion>,
}

impl TlsSessionInfo {
    fn capture(common: &CommonState, server_name: Option<String>) -> Self {
        Self {
            peer_certificates: common
                .peer_certificates()
                .map(<[CertificateDer<'static>]>::to_vec)
                .unwrap_or_default(),
            server_name,
            alpn_protocol: common.alpn_protocol().map(<[u8]>::to_vec),
            protocol_version: common.protocol_version(),
        }
    }

    /// 对端证书链，首个元素为对端自身证书；对端未出示证书时为空。
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certificates
    }

    /// 对端证书，即证书链的第一个元素。
    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.peer_certificates.first()
    }

    /// SNI：服务端为客户端请求的名称，客户端为自己请求的名称。
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn_protocol.as_deref()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }
}

/// 服务端 TLS 升级入口，支持热替换配置。
#[derive(Clone, Debug)]
pub struct TlsUpgrader {
    config: Arc<ArcSwap<ServerConfig>>,
}

impl TlsUpgrader {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config: Arc::new(ArcSwap::new(config)),
        }
    }

    /// 替换当前配置，只影响之后开始的握手。
    pub fn replace_config(&self, config: Arc<ServerConfig>) {
        self.config.store(config);
    }

    pub fn config_snapshot(&self) -> Arc<ServerConfig> {
        self.config.load_full()
    }

    /// 在 `io` 上执行服务端握手。
    pub async fn accept<IO>(
        &self,
        io: IO,
        endpoints: Endpoints,
    ) -> Result<(ServerTlsTransport<IO>, TlsSessionInfo), TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let acceptor = tokio_rustls::TlsAcceptor::from(self.config.load_full());
        let stream = acceptor
            .accept(io)
            .await
            .map_err(|source| TlsError::Handshake { source })?;
        let (_, connection) = stream.get_ref();
        let info = TlsSessionInfo::capture(connection, connection.server_name().map(str::to_owned));
        tracing::debug!(
            sni = info.server_name().unwrap_or("-"),
            version = ?info.protocol_version(),
            "tls handshake accepted"
        );
        Ok((StreamTransport::new(stream, endpoints), info))
    }
}

/// 客户端 TLS 握手入口。
#[derive(Clone, Debug)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// 以 `server_name` 作为 SNI 与证书校验名称执行客户端握手。
    pub async fn connect<IO>(
        &self,
        server_name: &str,
        io: IO,
        endpoints: Endpoints,
    ) -> Result<(ClientTlsTransport<IO>, TlsSessionInfo), TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let name = ServerName::try_from(server_name.to_owned()).map_err(|_| {
            TlsError::InvalidServerName {
                name: server_name.to_owned(),
            }
        })?;
        let connector = tokio_rustls::TlsConnector::from(Arc::clone(&self.config));
        let stream = connector
            .connect(name, io)
            .await
            .map_err(|source| TlsError::Handshake { source })?;
        let (_, connection) = stream.get_ref();
        let info = TlsSessionInfo::capture(connection, Some(server_name.to_owned()));
        tracing::debug!(sni = server_name, version = ?info.protocol_version(), "tls handshake connected");
        Ok((StreamTransport::new(stream, endpoints), info))
    }
}
