use bytes::{Buf, BytesMut};

use crate::error::ConnectionError;
use crate::filter::{FilterCursor, FilterError, FilterGraph};
use crate::queue::PackageWriter;

/// 连续多少步既未消费字节又未结束解析，即判定过滤器停滞。
pub(crate) const MAX_STALLED_STEPS: usize = 16;

/// 驱动过滤器图的同步解析器，由读取循环独占。
///
/// # 逻辑（How）
/// 对缓冲区反复执行当前过滤器：
/// 1. 过滤器失败 → 致命错误；
/// 2. 计入本步消费量，按“已归属当前包的字节数”执行长度守卫；未消费时把整个剩余缓冲都计入；
/// 3. 请求切换 → 移交上下文、重置旧过滤器，并立即在剩余缓冲上重跑，不等待新的 IO；
/// 4. 产出包 → 重置过滤器、入队，继续解析剩余缓冲；
/// 5. 既无包又无切换 → 等待更多输入。
pub(crate) struct Parser<P> {
    graph: FilterGraph<P>,
    max_package_length: usize,
    in_flight: usize,
}

impl<P: Send + 'static> Parser<P> {
    pub(crate) fn new(graph: FilterGraph<P>, max_package_length: usize) -> Self {
        Self {
            graph,
            max_package_length,
            in_flight: 0,
        }
    }

    pub(crate) fn parse(
        &mut self,
        buffer: &mut BytesMut,
        writer: &PackageWriter<P>,
    ) -> Result<(), ConnectionError> {
        let mut stalled = 0;
        while !buffer.is_empty() {
            let previous = self.graph.current();
            let (result, consumed, next) = {
                let filter = self
                    .graph
                    .current_mut()
                    .ok_or(FilterError::UnknownFilter(previous))?;
                let mut cursor = FilterCursor::new(&buffer[..], self.max_package_length);
                let result = filter.filter(&mut cursor);
                (result, cursor.consumed(), filter.take_next_filter())
            };
            let package = result?;

            self.in_flight += consumed;
            let attributed = if consumed == 0 {
                self.in_flight + buffer.len()
            } else {
                self.in_flight
            };
            if self.max_package_length > 0 && attributed > self.max_package_length {
                return Err(ConnectionError::PackageTooLarge {
                    length: attributed,
                    limit: self.max_package_length,
                });
            }
            buffer.advance(consumed);

            let switched = match next {
                Some(next) => {
                    self.graph.switch_to(next)?;
                    true
                }
                None => false,
            };
            if package.is_none() && !switched {
                return Ok(());
            }
            if let Some(filter) = self.graph.get_mut(previous) {
                filter.reset();
            }

            stalled = if consumed == 0 { stalled + 1 } else { 0 };
            if stalled > MAX_STALLED_STEPS {
                return Err(ConnectionError::Stalled { steps: stalled });
            }

            if let Some(package) = package {
                self.in_flight = 0;
                writer
                    .write(package)
                    .map_err(|_| ConnectionError::ConsumerGone)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterId, PipelineFilter};
    use crate::queue::{QueueStrategy, package_queue};

    struct Lines;

    impl PipelineFilter for Lines {
        type Package = Vec<u8>;

        fn filter(
            &mut self,
            cursor: &mut FilterCursor<'_>,
        ) -> Result<Option<Vec<u8>>, FilterError> {
            let Some(offset) = cursor.find(b"\n") else {
                return Ok(None);
            };
            let line = cursor.read_exact(offset).map(<[u8]>::to_vec);
            cursor.advance(1);
            Ok(line)
        }

        fn reset(&mut self) {}
    }

    /// 不消费任何字节、始终切换回自身的病态过滤器。
    struct Spinner(FilterId);

    impl PipelineFilter for Spinner {
        type Package = Vec<u8>;

        fn filter(&mut self, _: &mut FilterCursor<'_>) -> Result<Option<Vec<u8>>, FilterError> {
            Ok(None)
        }

        fn reset(&mut self) {}

        fn take_next_filter(&mut self) -> Option<FilterId> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn one_buffer_yields_every_complete_package() {
        let (writer, mut stream) = package_queue(QueueStrategy::Eager);
        let mut parser = Parser::new(FilterGraph::from(Lines), 0);
        let mut buffer = BytesMut::from(&b"a\nbb\nccc"[..]);
        parser.parse(&mut buffer, &writer).expect("解析应成功");
        assert_eq!(&buffer[..], b"ccc");
        assert_eq!(writer.depth(), 2);
        assert_eq!(stream.read().await.and_then(Result::ok), Some(b"a".to_vec()));
        assert_eq!(stream.read().await.and_then(Result::ok), Some(b"bb".to_vec()));
    }

    #[test]
    fn unterminated_overflow_is_rejected() {
        let (writer, _stream) = package_queue(QueueStrategy::Eager);
        let mut parser = Parser::new(FilterGraph::from(Lines), 4);
        let mut buffer = BytesMut::from(&b"abcdef"[..]);
        let error = parser.parse(&mut buffer, &writer).expect_err("超长必须失败");
        assert!(matches!(
            error,
            ConnectionError::PackageTooLarge { length: 6, limit: 4 }
        ));
        assert_eq!(writer.depth(), 0);
    }

    #[test]
    fn spinning_switches_are_stopped() {
        let (writer, _stream) = package_queue(QueueStrategy::Eager);
        let mut graph = FilterGraph::new();
        let id = graph.next_id();
        graph.push(Spinner(id));
        let mut parser = Parser::new(graph, 0);
        let mut buffer = BytesMut::from(&b"x"[..]);
        let error = parser.parse(&mut buffer, &writer).expect_err("停滞必须失败");
        assert!(matches!(error, ConnectionError::Stalled { .. }));
    }
}
