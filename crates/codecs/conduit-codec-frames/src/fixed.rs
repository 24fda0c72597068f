use std::num::NonZeroUsize;

use bytes::Bytes;
use conduit_core::{FilterCursor, FilterError, PipelineFilter};

use crate::length::LengthField;

/// 每个包恰好 `size` 字节的过滤器。
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeFilter {
    size: NonZeroUsize,
}

impl FixedSizeFilter {
    /// 以非零包长构造；零长度的包既不消费字节也无法推进解析。
    pub const fn new(size: NonZeroUsize) -> Self {
        Self { size }
    }

    /// 配置的包长。
    pub const fn size(&self) -> usize {
        self.size.get()
    }
}

impl PipelineFilter for FixedSizeFilter {
    type Package = Bytes;

    fn filter(&mut self, cursor: &mut FilterCursor<'_>) -> Result<Option<Bytes>, FilterError> {
        Ok(cursor.read_exact(self.size()).map(Bytes::copy_from_slice))
    }

    fn reset(&mut self) {}
}

/// 从定长头部解析包体长度。
///
/// # 契约说明（What）
/// - `header_len` 在过滤器生命周期内保持不变；
/// - `body_len` 只会在头部字节完整到达后被调用，返回 `Err` 视为协议错误。
pub trait HeaderDecoder: Send + 'static {
    /// 头部字节数。
    fn header_len(&self) -> usize;

    /// 根据头部计算包体长度。
    fn body_len(&self, header: &[u8]) -> Result<usize, FilterError>;
}

impl HeaderDecoder for LengthField {
    fn header_len(&self) -> usize {
        self.width()
    }

    fn body_len(&self, header: &[u8]) -> Result<usize, FilterError> {
        let declared = self.read(header);
        usize::try_from(declared).map_err(|_| {
            FilterError::protocol(format!("declared body length {declared} does not fit in usize"))
        })
    }
}

/// 定长头部过滤器产出的帧：头部与包体共用一块连续内存。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFrame {
    bytes: Bytes,
    header_len: usize,
}

impl HeaderFrame {
    /// 头部字节。
    pub fn header(&self) -> &[u8] {
        &self.bytes[..self.header_len]
    }

    /// 包体字节。
    pub fn body(&self) -> Bytes {
        self.bytes.slice(self.header_len..)
    }

    /// 完整帧（头部 + 包体）。
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// 取出完整帧。
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// 定长头部 + 变长包体的过滤器。
///
/// # 设计动机（Why）
/// - 二进制协议普遍以头部声明包体长度；读到头部即可判断帧是否超限，无需等待包体到达；
/// - 恶意对端可能声明超大长度并缓慢发送，提前拒绝可避免缓冲区无谓增长。
///
/// # 行为概览（How）
/// 1. 头部未完整 → 等待，不消费；
/// 2. 头部完整 → 交给 [`HeaderDecoder`] 计算包体长度，总长超过 `max_package_length` 时立即返回
///    [`FilterError::DeclaredLengthTooLarge`]；
/// 3. 包体完整 → 一次性读取头部与包体，产出 [`HeaderFrame`]。
///
/// # 契约说明（What）
/// - 帧完整前游标不推进，因此过滤器自身无增量状态；
/// - 已解析的包体长度缓存在 `declared` 中，直至产出包或被重置。
#[derive(Debug, Clone)]
pub struct FixedHeaderFilter<H> {
    decoder: H,
    declared: Option<usize>,
}

impl<H: HeaderDecoder> FixedHeaderFilter<H> {
    /// 以头部解码器构造过滤器。
    pub fn new(decoder: H) -> Self {
        Self {
            decoder,
            declared: None,
        }
    }

    /// 头部解码器。
    pub fn decoder(&self) -> &H {
        &self.decoder
    }

    fn declared_total(&mut self, cursor: &FilterCursor<'_>) -> Result<Option<usize>, FilterError> {
        let header_len = self.decoder.header_len();
        if let Some(body) = self.declared {
            return Ok(Some(header_len + body));
        }
        let Some(header) = cursor.unread().get(..header_len) else {
            return Ok(None);
        };
        let body = self.decoder.body_len(header)?;
        let total = header_len
            .checked_add(body)
            .ok_or_else(|| FilterError::protocol("declared frame length overflows usize"))?;
        let limit = cursor.max_package_length();
        if limit > 0 && total > limit {
            return Err(FilterError::DeclaredLengthTooLarge {
                declared: total,
                limit,
            });
        }
        self.declared = Some(body);
        Ok(Some(total))
    }
}

impl<H: HeaderDecoder> PipelineFilter for FixedHeaderFilter<H> {
    type Package = HeaderFrame;

    fn filter(&mut self, cursor: &mut FilterCursor<'_>) -> Result<Option<HeaderFrame>, FilterError> {
        let Some(total) = self.declared_total(cursor)? else {
            return Ok(None);
        };
        Ok(cursor.read_exact(total).map(|frame| HeaderFrame {
            bytes: Bytes::copy_from_slice(frame),
            header_len: self.decoder.header_len(),
        }))
    }

    fn reset(&mut self) {
        self.declared = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(size: usize) -> FixedSizeFilter {
        FixedSizeFilter::new(NonZeroUsize::new(size).expect("non-zero size"))
    }

    #[test]
    fn fixed_size_waits_for_a_full_package() {
        let mut filter = fixed(4);
        let mut short = FilterCursor::new(b"abc", 0);
        assert!(filter.filter(&mut short).expect("filter succeeds").is_none());
        assert_eq!(short.consumed(), 0);

        let mut full = FilterCursor::new(b"abcdef", 0);
        let package = filter.filter(&mut full).expect("filter succeeds");
        assert_eq!(package.as_deref(), Some(&b"abcd"[..]));
        assert_eq!(full.remaining(), 2);
    }

    #[test]
    fn header_frame_keeps_header_and_body() {
        let mut filter = FixedHeaderFilter::new(LengthField::U16);
        let mut cursor = FilterCursor::new(b"\x00\x03abcXYZ", 0);
        let frame = filter
            .filter(&mut cursor)
            .expect("filter succeeds")
            .expect("complete frame");
        assert_eq!(frame.header(), b"\x00\x03");
        assert_eq!(&frame.body()[..], b"abc");
        assert_eq!(cursor.unread(), b"XYZ");
    }

    #[test]
    fn partial_body_keeps_declared_length() {
        let mut filter = FixedHeaderFilter::new(LengthField::U8);
        let mut cursor = FilterCursor::new(b"\x05ab", 0);
        assert!(filter.filter(&mut cursor).expect("filter succeeds").is_none());
        assert_eq!(cursor.consumed(), 0);
        assert_eq!(filter.declared, Some(5));

        filter.reset();
        assert_eq!(filter.declared, None);
    }

    #[test]
    fn oversized_declaration_is_rejected_before_the_body_arrives() {
        // 头部声明 0x0400 = 1024 字节，上限 64：无需等待包体即可拒绝。
        let mut filter = FixedHeaderFilter::new(LengthField::U16);
        let mut cursor = FilterCursor::new(b"\x04\x00", 64);
        match filter.filter(&mut cursor) {
            Err(FilterError::DeclaredLengthTooLarge { declared, limit }) => {
                assert_eq!(declared, 1026);
                assert_eq!(limit, 64);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn empty_body_is_a_valid_frame() {
        let mut filter = FixedHeaderFilter::new(LengthField::U32);
        let mut cursor = FilterCursor::new(b"\x00\x00\x00\x00", 0);
        let frame = filter
            .filter(&mut cursor)
            .expect("filter succeeds")
            .expect("complete frame");
        assert!(frame.body().is_empty());
        assert_eq!(cursor.consumed(), 4);
    }
}
