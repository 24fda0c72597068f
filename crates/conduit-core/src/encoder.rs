use bytes::BytesMut;
use thiserror::Error;

/// 编码失败；只影响本次发送，不会关闭连接。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EncodeError {
    #[error("package of {length} bytes exceeds the encoder limit of {limit} bytes")]
    TooLarge { length: usize, limit: usize },
    #[error("invalid package: {0}")]
    Invalid(String),
}

/// 把结构化包写入出站缓冲。
///
/// # 契约（What）
/// - `encode` 在写路径互斥区内被调用，`dst` 是连接的出站暂存区；
/// - 返回写入的字节数；失败时实现不得留下半个包，引擎会回滚本次写入的字节。
pub trait PackageEncoder<P: ?Sized>: Send + Sync {
    fn encode(&self, dst: &mut BytesMut, package: &P) -> Result<usize, EncodeError>;
}

impl<P: ?Sized, E: PackageEncoder<P> + ?Sized> PackageEncoder<P> for &E {
    fn encode(&self, dst: &mut BytesMut, package: &P) -> Result<usize, EncodeError> {
        (**self).encode(dst, package)
    }
}
