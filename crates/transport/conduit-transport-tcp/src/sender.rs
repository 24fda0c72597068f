//! 池化的分散-聚集发送器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 管道写模式下一次 `drain` 携带多个分段，逐段 `write_all` 会产生多次系统调用；
//!   `write_vectored` 可一次提交全部分段；
//! - 每次发送都新建分段队列会在高频小包场景下反复分配，因此发送器在连接之间复用。
//!
//! ## 逻辑（How）
//! - [`SocketSender`] 持有可复用的分段队列，每轮从队首取最多 [`MAX_IO_SLICES`] 个分段填入栈上的
//!   `IoSlice` 数组，提交后按实际写出字节数推进队列，直到全部写完；
//! - [`SenderPool`] 以互斥保护的空闲列表保存发送器，超过保留上限的发送器直接丢弃。
//!
//! ## 风险（Trade-offs）
//! - 发送被取消（例如发送超时）时，正在使用的发送器不会归还，只影响池的命中率。

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::{Arc, OnceLock};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// 单次 `write_vectored` 最多提交的分段数。
pub const MAX_IO_SLICES: usize = 64;

/// 默认保留的空闲发送器数量。
pub const DEFAULT_RETAINED_SENDERS: usize = 256;

/// 可复用的分散-聚集发送器。
#[derive(Debug, Default)]
pub struct SocketSender {
    queue: VecDeque<Bytes>,
}

impl SocketSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把全部分段写入 `writer`，返回写出的总字节数。
    ///
    /// 对端不再接收（`write_vectored` 返回 0）时报告 `WriteZero`。
    pub async fn send<W>(&mut self, writer: &mut W, segments: &[Bytes]) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.queue.clear();
        self.queue
            .extend(segments.iter().filter(|segment| !segment.is_empty()).cloned());
        let result = self.flush_queue(writer).await;
        self.queue.clear();
        result
    }

    async fn flush_queue<W>(&mut self, writer: &mut W) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0;
        while !self.queue.is_empty() {
            let written = {
                let mut slices = [IoSlice::new(&[]); MAX_IO_SLICES];
                let mut count = 0;
                for (slot, segment) in slices.iter_mut().zip(self.queue.iter()) {
                    *slot = IoSlice::new(segment);
                    count += 1;
                }
                writer.write_vectored(&slices[..count]).await?
            };
            if written == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            total += written;
            self.consume(written);
        }
        Ok(total)
    }

    fn consume(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.queue.front_mut() else {
                return;
            };
            if front.len() <= written {
                written -= front.len();
                self.queue.pop_front();
            } else {
                front.advance(written);
                written = 0;
            }
        }
    }
}

/// 跨连接共享的发送器池。
#[derive(Debug)]
pub struct SenderPool {
    idle: Mutex<Vec<SocketSender>>,
    retained: usize,
}

impl SenderPool {
    /// 创建最多保留 `retained` 个空闲发送器的池。
    pub fn new(retained: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            retained,
        }
    }

    /// 进程级默认池。
    pub fn shared() -> Arc<SenderPool> {
        static SHARED: OnceLock<Arc<SenderPool>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(SenderPool::new(DEFAULT_RETAINED_SENDERS))))
    }

    /// 取出一个空闲发送器，池空时新建。
    pub fn acquire(&self) -> SocketSender {
        self.idle.lock().pop().unwrap_or_default()
    }

    /// 归还发送器；超过保留上限时丢弃。
    pub fn release(&self, sender: SocketSender) {
        let mut idle = self.idle.lock();
        if idle.len() < self.retained {
            idle.push(sender);
        }
    }

    /// 当前空闲发送器数量。
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for SenderPool {
    fn default() -> Self {
        Self::new(DEFAULT_RETAINED_SENDERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn pool_retains_up_to_its_cap() {
        let pool = SenderPool::new(2);
        let senders: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        for sender in senders {
            pool.release(sender);
        }
        assert_eq!(pool.idle(), 2);
        let _reused = pool.acquire();
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn partial_vectored_writes_are_resumed() {
        // `duplex` 的 `write_vectored` 每次只写第一个非空分段，且容量只有 16 字节，
        // 发送器必须在多轮部分写入之间正确推进队列。
        let (mut writer, mut reader) = tokio::io::duplex(16);
        let segments: Vec<Bytes> = (0..10)
            .map(|index| Bytes::from(format!("segment-{index:02};")))
            .collect();
        let expected: Vec<u8> = segments.iter().flat_map(|segment| segment.to_vec()).collect();

        let reading = tokio::spawn(async move {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.map(|_| received)
        });
        let mut sender = SocketSender::new();
        let written = sender
            .send(&mut writer, &segments)
            .await
            .expect("send succeeds");
        drop(writer);

        assert_eq!(written, expected.len());
        let received = reading
            .await
            .expect("reader task")
            .expect("read succeeds");
        assert_eq!(received, expected);
        assert!(sender.queue.is_empty());
    }

    #[tokio::test]
    async fn more_segments_than_slices_are_sent_in_order() {
        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
        let segments: Vec<Bytes> = (0..(MAX_IO_SLICES * 3))
            .map(|index| Bytes::from(vec![(index % 251) as u8; 7]))
            .collect();
        let mut sender = SocketSender::new();
        let written = sender
            .send(&mut writer, &segments)
            .await
            .expect("send succeeds");
        assert_eq!(written, segments.len() * 7);

        let mut received = vec![0_u8; written];
        reader
            .read_exact(&mut received)
            .await
            .expect("read succeeds");
        let expected: Vec<u8> = segments.iter().flat_map(|segment| segment.to_vec()).collect();
        assert_eq!(received, expected);
    }
}
