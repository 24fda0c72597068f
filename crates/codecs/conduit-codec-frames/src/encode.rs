use bytes::{BufMut, Bytes, BytesMut};
use conduit_core::{EncodeError, PackageEncoder};

use crate::length::LengthField;

/// 把包体写出并追加分隔符，与 [`crate::TerminatorFilter`] 对称。
///
/// 包体内出现分隔符会破坏分帧，此时返回 [`EncodeError::Invalid`] 且不写入任何字节。
#[derive(Debug, Clone)]
pub struct LineEncoder {
    terminator: Bytes,
}

impl LineEncoder {
    /// 以指定分隔符构造编码器。
    pub fn new(terminator: impl Into<Bytes>) -> Self {
        Self {
            terminator: terminator.into(),
        }
    }

    /// `\r\n` 结尾的行。
    pub fn crlf() -> Self {
        Self::new(&b"\r\n"[..])
    }

    /// `\n` 结尾的行。
    pub fn newline() -> Self {
        Self::new(&b"\n"[..])
    }
}

impl<P> PackageEncoder<P> for LineEncoder
where
    P: AsRef<[u8]> + ?Sized,
{
    fn encode(&self, dst: &mut BytesMut, package: &P) -> Result<usize, EncodeError> {
        let body = package.as_ref();
        if !self.terminator.is_empty()
            && body
                .windows(self.terminator.len())
                .any(|window| window == &self.terminator[..])
        {
            return Err(EncodeError::Invalid(
                "package body contains the line terminator".into(),
            ));
        }
        dst.reserve(body.len() + self.terminator.len());
        dst.put_slice(body);
        dst.put_slice(&self.terminator);
        Ok(body.len() + self.terminator.len())
    }
}

/// 先写大端长度字段再写包体，与 `FixedHeaderFilter<LengthField>` 对称。
///
/// # 契约说明（What）
/// - 包体长度超过字段可表达范围或配置上限时返回 [`EncodeError::TooLarge`]；
/// - 上限以完整帧（字段 + 包体）计，便于与对端的 `max_package_length` 对齐，0 表示不限。
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixEncoder {
    field: LengthField,
    max_frame_length: usize,
}

impl LengthPrefixEncoder {
    /// 以长度字段宽度构造编码器，不设帧长上限。
    pub const fn new(field: LengthField) -> Self {
        Self {
            field,
            max_frame_length: 0,
        }
    }

    /// 设置完整帧的长度上限。
    pub const fn with_max_frame_length(mut self, limit: usize) -> Self {
        self.max_frame_length = limit;
        self
    }

    /// 长度字段宽度。
    pub const fn field(&self) -> LengthField {
        self.field
    }
}

impl<P> PackageEncoder<P> for LengthPrefixEncoder
where
    P: AsRef<[u8]> + ?Sized,
{
    fn encode(&self, dst: &mut BytesMut, package: &P) -> Result<usize, EncodeError> {
        let body = package.as_ref();
        let representable = u64::try_from(body.len())
            .ok()
            .filter(|length| *length <= self.field.max_value());
        let Some(declared) = representable else {
            return Err(EncodeError::TooLarge {
                length: body.len(),
                limit: usize::try_from(self.field.max_value()).unwrap_or(usize::MAX),
            });
        };
        let frame = self.field.width() + body.len();
        if self.max_frame_length > 0 && frame > self.max_frame_length {
            return Err(EncodeError::TooLarge {
                length: frame,
                limit: self.max_frame_length,
            });
        }
        dst.reserve(frame);
        self.field.write(dst, declared);
        dst.put_slice(body);
        Ok(frame)
    }
}
