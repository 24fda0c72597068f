//! 管道过滤器契约：把缓冲字节增量解析为零或一个完整的包。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 引擎不理解任何帧格式，定长、长度前缀、分隔符或自定义格式都是本契约的外部实现；
//! - 协议切换（例如首字节判别后改用另一种帧格式）要求过滤器能够指向后继，且后继可以再指回前驱，
//!   因此过滤器之间的关系是**图**而非链表。
//!
//! ## 逻辑（How）
//! - 所有过滤器登记在 [`FilterGraph`] 中，以 [`FilterId`] 互相引用；解析循环只持有“当前过滤器”的编号，
//!   切换时重新赋值，循环引用不涉及所有权环；
//! - 切换时通过 [`PipelineFilter::take_context`]/[`PipelineFilter::set_context`] 把不透明上下文移交后继，
//!   已经计算出的事实（如声明的包体长度）无需重复解析。
//!
//! ## 契约（What）
//! - `filter` 只能通过 [`FilterCursor`] 消费字节；返回 `Ok(None)` 表示需要更多数据或已请求切换；
//! - 产出包或切换后引擎会调用 `reset`，过滤器必须在其中清空私有增量状态；
//! - 返回 `Err` 对连接始终是致命的，引擎以协议错误关闭连接。

use std::any::Any;
use std::fmt;

use thiserror::Error;

/// 过滤器报告的解析失败。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FilterError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("declared package length {declared} exceeds the limit of {limit} bytes")]
    DeclaredLengthTooLarge { declared: usize, limit: usize },
    #[error("switch target {0} is not registered in the filter graph")]
    UnknownFilter(FilterId),
    #[error("failed to decode package: {source}")]
    Decode {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl FilterError {
    pub fn protocol(message: impl Into<String>) -> Self {
        FilterError::Protocol(message.into())
    }

    pub fn decode(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        FilterError::Decode {
            source: Box::new(source),
        }
    }
}

/// 只读游标，覆盖“已缓冲但尚未消费”的字节。
///
/// 游标推进的距离即本步消费的字节数；未推进的字节保留到下一次调用。
#[derive(Debug)]
pub struct FilterCursor<'a> {
    data: &'a [u8],
    position: usize,
    max_package_length: usize,
}

impl<'a> FilterCursor<'a> {
    pub fn new(data: &'a [u8], max_package_length: usize) -> Self {
        Self {
            data,
            position: 0,
            max_package_length,
        }
    }

    /// 配置的最大包长度，0 表示不限。
    pub fn max_package_length(&self) -> usize {
        self.max_package_length
    }

    pub fn consumed(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// 尚未消费的全部字节，不推进游标。
    pub fn unread(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.peek_u8()?;
        self.position += 1;
        Some(byte)
    }

    /// 读取恰好 `len` 字节；不足时不推进并返回 `None`。
    pub fn read_exact(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let start = self.position;
        self.position += len;
        Some(&self.data[start..self.position])
    }

    /// 跳过 `len` 字节，返回实际跳过的数量。
    pub fn advance(&mut self, len: usize) -> usize {
        let step = len.min(self.remaining());
        self.position += step;
        step
    }

    /// 查找分隔符相对当前位置的偏移。
    pub fn find(&self, delimiter: &[u8]) -> Option<usize> {
        if delimiter.is_empty() {
            return None;
        }
        self.unread()
            .windows(delimiter.len())
            .position(|window| window == delimiter)
    }
}

/// 跨过滤器切换移交的不透明上下文。
pub struct FilterContext(Box<dyn Any + Send>);

impl FilterContext {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut()
    }

    /// 按类型取出内部值；类型不符时原样返还。
    pub fn into_inner<T: Any>(self) -> Result<T, Self> {
        match self.0.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(original) => Err(Self(original)),
        }
    }
}

impl fmt::Debug for FilterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterContext").finish_non_exhaustive()
    }
}

/// 过滤器在 [`FilterGraph`] 中的编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(usize);

impl FilterId {
    /// 以登记序号构造编号；第 `n` 个登记的过滤器编号为 `n`。
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 增量解析器契约。
///
/// # 契约（What）
/// - `filter`：基于游标产出零或一个包；
/// - `reset`：清空私有增量状态，引擎在产出包或切换离开后调用；
/// - `take_next_filter`：本步请求的后继过滤器，引擎每步取走一次，过滤器应在取走后视为未请求；
/// - `take_context`/`set_context`：切换时的上下文移交，缺省实现不携带上下文。
pub trait PipelineFilter: Send + 'static {
    type Package: Send + 'static;

    fn filter(
        &mut self,
        cursor: &mut FilterCursor<'_>,
    ) -> Result<Option<Self::Package>, FilterError>;

    fn reset(&mut self);

    fn take_next_filter(&mut self) -> Option<FilterId> {
        None
    }

    fn take_context(&mut self) -> Option<FilterContext> {
        None
    }

    fn set_context(&mut self, _context: Option<FilterContext>) {}
}

type BoxedFilter<P> = Box<dyn PipelineFilter<Package = P>>;

/// 过滤器图：登记所有可能被激活的过滤器，并记录当前激活者。
///
/// 编号按登记顺序分配，可通过 [`FilterGraph::next_id`] 预先得知，从而构造相互引用的过滤器。
pub struct FilterGraph<P> {
    filters: Vec<BoxedFilter<P>>,
    current: FilterId,
}

impl<P: Send + 'static> FilterGraph<P> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            current: FilterId(0),
        }
    }

    /// 下一次 [`push`](FilterGraph::push) 将分配的编号。
    pub fn next_id(&self) -> FilterId {
        FilterId(self.filters.len())
    }

    pub fn push<F>(&mut self, filter: F) -> FilterId
    where
        F: PipelineFilter<Package = P>,
    {
        let id = self.next_id();
        self.filters.push(Box::new(filter));
        id
    }

    /// 指定入口过滤器，缺省为第一个登记者。
    pub fn with_entry(mut self, id: FilterId) -> Self {
        self.current = id;
        self
    }

    pub fn current(&self) -> FilterId {
        self.current
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn contains(&self, id: FilterId) -> bool {
        id.0 < self.filters.len()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut BoxedFilter<P>> {
        self.filters.get_mut(self.current.0)
    }

    pub(crate) fn get_mut(&mut self, id: FilterId) -> Option<&mut BoxedFilter<P>> {
        self.filters.get_mut(id.0)
    }

    /// 切换当前过滤器并移交上下文；目标未登记时保持不变并返回错误。
    pub(crate) fn switch_to(&mut self, next: FilterId) -> Result<(), FilterError> {
        if !self.contains(next) {
            return Err(FilterError::UnknownFilter(next));
        }
        let context = self
            .current_mut()
            .and_then(|filter| filter.take_context());
        self.current = next;
        if let Some(filter) = self.current_mut() {
            filter.set_context(context);
        }
        Ok(())
    }
}

impl<P: Send + 'static> Default for FilterGraph<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PipelineFilter> From<F> for FilterGraph<F::Package> {
    fn from(filter: F) -> Self {
        let mut graph = FilterGraph::new();
        graph.push(filter);
        graph
    }
}

impl<P> fmt::Debug for FilterGraph<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterGraph")
            .field("filters", &self.filters.len())
            .field("current", &self.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_only_advances_on_complete_reads() {
        let data = b"abc";
        let mut cursor = FilterCursor::new(data, 0);
        assert_eq!(cursor.read_exact(4), None);
        assert_eq!(cursor.consumed(), 0);
        assert_eq!(cursor.read_exact(2), Some(&b"ab"[..]));
        assert_eq!(cursor.find(b"c"), Some(0));
        assert_eq!(cursor.advance(10), 1);
        assert!(cursor.is_empty());
    }

    #[test]
    fn context_round_trips_by_type() {
        let context = FilterContext::new(42_usize);
        assert_eq!(context.downcast_ref::<usize>(), Some(&42));
        let context = context.into_inner::<String>().expect_err("类型不符应返还原值");
        assert_eq!(context.into_inner::<usize>().ok(), Some(42));
    }
}
