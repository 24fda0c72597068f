use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use crate::close::CloseReason;
use crate::error::{ConnectionError, FILL};
use crate::queue::PackageWriter;
use crate::transport::{InputHalf, OutputHalf};

use super::Shared;
use super::parse::Parser;

/// 读取循环的退出方式。
pub(crate) enum Outcome {
    /// 取消信号触发（关闭或分离请求）。
    Cancelled,
    /// 正常结束：输入结束、可忽略的故障或消费者离开，不向消费者报告错误。
    Ended(CloseReason),
    /// 致命故障，已记录日志，需向消费者报告。
    Failed(ConnectionError),
}

/// 读取循环交还给收尾逻辑的资源。
pub(crate) struct LoopExit<I> {
    pub(crate) input: I,
    pub(crate) pending: BytesMut,
    pub(crate) outcome: Outcome,
}

enum FillFailure {
    Timeout(Duration),
    Io(std::io::Error),
}

async fn fill_once<I: InputHalf>(
    input: &mut I,
    buffer: &mut BytesMut,
    timeout: Option<Duration>,
) -> Result<usize, FillFailure> {
    match timeout {
        Some(after) => match tokio::time::timeout(after, input.fill(buffer)).await {
            Ok(result) => result.map_err(FillFailure::Io),
            Err(_) => Err(FillFailure::Timeout(after)),
        },
        None => input.fill(buffer).await.map_err(FillFailure::Io),
    }
}

/// 读取-解析-入队循环。
///
/// # 逻辑（How）
/// 1. 若缓冲中已有上一个引擎遗留的字节，先解析一次；
/// 2. 按需策略下等待上一个包被消费；
/// 3. 预留接收缓冲后调用 `fill`，与取消信号竞争；
/// 4. 成功填充后刷新活跃时间并解析，直到输入结束、故障或取消。
///
/// # 契约（What）
/// - 解析器只在本任务中被驱动，绝不并发进入；
/// - 输入结束时即使缓冲中残留半帧也不再调用过滤器，不会产出残缺包。
pub(crate) async fn read_loop<I, O, P>(
    shared: Arc<Shared<I, O>>,
    mut input: I,
    mut buffer: BytesMut,
    mut parser: Parser<P>,
    writer: PackageWriter<P>,
) -> LoopExit<I>
where
    I: InputHalf,
    O: OutputHalf,
    P: Send + 'static,
{
    let receive_buffer_size = shared.options.receive_buffer_size;
    let timeout = shared.options.receive_timeout();

    let mut outcome = if buffer.is_empty() {
        None
    } else {
        parser.parse(&mut buffer, &writer).err().map(fault_outcome)
    };

    while outcome.is_none() {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                outcome = Some(Outcome::Cancelled);
                break;
            }
            _ = writer.demand() => {}
        }

        buffer.reserve(receive_buffer_size);
        let filled = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                outcome = Some(Outcome::Cancelled);
                break;
            }
            result = fill_once(&mut input, &mut buffer, timeout) => result,
        };

        match filled {
            Ok(0) => {
                outcome = Some(Outcome::Ended(CloseReason::RemoteClosing));
            }
            Ok(_) => {
                shared.activity.touch();
                if let Err(error) = parser.parse(&mut buffer, &writer) {
                    outcome = Some(fault_outcome(error));
                }
            }
            Err(FillFailure::Timeout(after)) => {
                outcome = Some(Outcome::Failed(ConnectionError::Timeout { op: FILL, after }));
            }
            Err(FillFailure::Io(source)) => {
                let reason = input.classify(&source).close_reason();
                outcome = Some(if reason == CloseReason::RemoteClosing {
                    Outcome::Ended(reason)
                } else {
                    Outcome::Failed(ConnectionError::io(FILL, source))
                });
            }
        }
    }

    let outcome = outcome.unwrap_or(Outcome::Cancelled);
    if let Outcome::Failed(error) = &outcome {
        let stage = match error {
            ConnectionError::Io { .. } | ConnectionError::Timeout { .. } => "fill",
            _ => "parse",
        };
        shared.log_fault(stage, error, error_reason(&input, error));
    }
    LoopExit {
        input,
        pending: buffer,
        outcome,
    }
}

fn fault_outcome(error: ConnectionError) -> Outcome {
    match error {
        ConnectionError::ConsumerGone => Outcome::Ended(CloseReason::LocalClosing),
        error => Outcome::Failed(error),
    }
}

/// 故障的关闭原因；IO 故障交由输入半部的分类器判定。
pub(crate) fn error_reason<I: InputHalf>(input: &I, error: &ConnectionError) -> CloseReason {
    match error {
        ConnectionError::Io { source, .. } => input.classify(source).close_reason(),
        error => error.close_reason(),
    }
}
