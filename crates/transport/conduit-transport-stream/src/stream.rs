use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use conduit_core::{ConnectionOptions, Endpoints, InputHalf, OutputHalf, Transport, WriteMode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::StreamTransportError;

/// 任意双向字节流上的传输。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TLS、压缩流、进程管道等分层流只暴露 `AsyncRead + AsyncWrite`，没有套接字句柄可供分散-聚集写入；
///   本适配器用最通用的“两条管道”方式把它们接入引擎。
///
/// ## 逻辑（How）
/// - `tokio::io::split` 拆出读写两半，读半部每次 `fill` 执行一次 `read_buf`；
/// - 写半部按顺序逐段 `write_all`，每次 `drain` 末尾 `flush`，保证分层流（如 TLS 记录层）及时落盘；
/// - 关闭时调用 `shutdown`，分层流借此发送各自的结束标记（TLS 的 `close_notify`）。
///
/// ## 契约（What）
/// - 端点由调用方提供，分层流通常无法自行得知；
/// - 分离后的两半可经 [`reunite`] 合并回原始流。
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    endpoints: Endpoints,
    write_mode: WriteMode,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, endpoints: Endpoints) -> Self {
        Self {
            stream,
            endpoints,
            write_mode: WriteMode::Piped,
        }
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Input = StreamInput<S>;
    type Output = StreamOutput<S>;

    fn endpoints(&self) -> Endpoints {
        self.endpoints.clone()
    }

    fn into_halves(self) -> (StreamInput<S>, StreamOutput<S>) {
        let (reader, writer) = tokio::io::split(self.stream);
        (
            StreamInput { reader },
            StreamOutput {
                writer,
                write_mode: self.write_mode,
            },
        )
    }
}

/// 分层流的读半部。
#[derive(Debug)]
pub struct StreamInput<S> {
    reader: ReadHalf<S>,
}

#[async_trait]
impl<S> InputHalf for StreamInput<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.reader.read_buf(buf).await
    }
}

/// 分层流的写半部。
#[derive(Debug)]
pub struct StreamOutput<S> {
    writer: WriteHalf<S>,
    write_mode: WriteMode,
}

#[async_trait]
impl<S> OutputHalf for StreamOutput<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn drain(&mut self, segments: &[Bytes]) -> io::Result<usize> {
        let mut sent = 0;
        for segment in segments {
            self.writer.write_all(segment).await?;
            sent += segment.len();
        }
        self.writer.flush().await?;
        Ok(sent)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    fn write_mode(&self, _options: &ConnectionOptions) -> WriteMode {
        self.write_mode
    }
}

/// 把分离后交还的两半合并回原始流。
pub fn reunite<S>(input: StreamInput<S>, output: StreamOutput<S>) -> Result<S, StreamTransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !input.reader.is_pair_of(&output.writer) {
        return Err(StreamTransportError::Mismatched);
    }
    Ok(input.reader.unsplit(output.writer))
}
