use bytes::Bytes;
use conduit_core::{FilterCursor, FilterError, PipelineFilter};

/// 以固定分隔符切分包的过滤器，产出的包不含分隔符。
///
/// # 设计动机（Why）
/// - 文本协议（命令行、`\r\n` 结尾的请求）最常见的分帧方式；
/// - 帧未完整时不消费字节，超长行由引擎的长度守卫拦截，过滤器无需自带上限。
///
/// # 行为概览（How）
/// - 记录已扫描但未命中的偏移，下次只从可能跨块的位置继续查找，避免对长缓冲反复全量扫描；
/// - 命中后读取包体并跳过分隔符；`reset` 清空扫描进度。
#[derive(Debug, Clone)]
pub struct TerminatorFilter {
    terminator: Bytes,
    scanned: usize,
}

impl TerminatorFilter {
    /// 以任意非空分隔符构造过滤器；空分隔符永远无法命中。
    pub fn new(terminator: impl Into<Bytes>) -> Self {
        Self {
            terminator: terminator.into(),
            scanned: 0,
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

    /// 当前使用的分隔符。
    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }
}

impl PipelineFilter for TerminatorFilter {
    type Package = Bytes;

    fn filter(&mut self, cursor: &mut FilterCursor<'_>) -> Result<Option<Bytes>, FilterError> {
        if self.terminator.is_empty() {
            return Err(FilterError::protocol("terminator must not be empty"));
        }
        let unread = cursor.unread();
        // 上次扫描末尾可能停在分隔符中间，回退 `len - 1` 字节重新比对。
        let start = self
            .scanned
            .saturating_sub(self.terminator.len() - 1)
            .min(unread.len());
        let found = unread[start..]
            .windows(self.terminator.len())
            .position(|window| window == &self.terminator[..]);
        let Some(offset) = found.map(|offset| start + offset) else {
            self.scanned = unread.len();
            return Ok(None);
        };

        let body = cursor
            .read_exact(offset)
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        cursor.advance(self.terminator.len());
        Ok(Some(body))
    }

    fn reset(&mut self) {
        self.scanned = 0;
    }
}
