//! 虚拟（内存）传输：没有连续字节流，每次 `fill` 交付一个外部写入的数据块。
//!
//! 数据报监听器、测试桩或任何自行分发输入的宿主都通过它把数据块送入引擎；
//! 输出侧把每个分段投递到调用方持有的通道。

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::endpoint::{Endpoint, Endpoints};
use crate::options::ConnectionOptions;
use crate::transport::{InputHalf, OutputHalf, Transport, WriteMode};

/// 外部写入端：每次 `write` 对应引擎的一次 `fill`。
#[derive(Clone, Debug)]
pub struct BlockSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl BlockSender {
    /// 投递一个数据块；输入端已释放时返回 `BrokenPipe`。
    pub fn write(&self, block: impl Into<Bytes>) -> io::Result<()> {
        self.tx
            .send(block.into())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 以数据块为单位的输入半部；所有写入端释放后输入结束。
#[derive(Debug)]
pub struct VirtualInput {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl VirtualInput {
    pub fn channel() -> (BlockSender, VirtualInput) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BlockSender { tx }, VirtualInput { rx })
    }

    pub fn from_receiver(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl InputHalf for VirtualInput {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        loop {
            match self.rx.recv().await {
                None => return Ok(0),
                Some(block) if block.is_empty() => continue,
                Some(block) => {
                    buf.extend_from_slice(&block);
                    return Ok(block.len());
                }
            }
        }
    }
}

/// 把每个分段投递到通道的输出半部。
#[derive(Debug)]
pub struct VirtualOutput {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    write_mode: WriteMode,
}

impl VirtualOutput {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            tx: Some(tx),
            write_mode: WriteMode::Piped,
        }
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }
}

#[async_trait]
impl OutputHalf for VirtualOutput {
    async fn drain(&mut self, segments: &[Bytes]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let mut sent = 0;
        for segment in segments {
            tx.send(segment.clone())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            sent += segment.len();
        }
        Ok(sent)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }

    fn write_mode(&self, _options: &ConnectionOptions) -> WriteMode {
        self.write_mode
    }
}

/// 完全位于内存中的传输。
#[derive(Debug)]
pub struct VirtualTransport {
    input: VirtualInput,
    output: VirtualOutput,
    endpoints: Endpoints,
}

impl VirtualTransport {
    /// 创建传输及其对端句柄。
    pub fn pair() -> (VirtualTransport, VirtualPeer) {
        let (sender, input) = VirtualInput::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = VirtualTransport {
            input,
            output: VirtualOutput::new(tx),
            endpoints: Endpoints::new(Endpoint::named("memory:peer"), Endpoint::named("memory:local")),
        };
        let peer = VirtualPeer {
            sender: Some(sender),
            rx,
        };
        (transport, peer)
    }

    /// 以调用方持有的输入/输出队列构造。
    pub fn from_channels(
        input: mpsc::UnboundedReceiver<Bytes>,
        output: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            input: VirtualInput::from_receiver(input),
            output: VirtualOutput::new(output),
            endpoints: Endpoints::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.output = self.output.with_write_mode(write_mode);
        self
    }
}

impl Transport for VirtualTransport {
    type Input = VirtualInput;
    type Output = VirtualOutput;

    fn endpoints(&self) -> Endpoints {
        self.endpoints.clone()
    }

    fn into_halves(self) -> (VirtualInput, VirtualOutput) {
        (self.input, self.output)
    }
}

/// 虚拟传输的对端：写入输入数据块，读取引擎发出的分段。
#[derive(Debug)]
pub struct VirtualPeer {
    sender: Option<BlockSender>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl VirtualPeer {
    pub fn write(&self, block: impl Into<Bytes>) -> io::Result<()> {
        match &self.sender {
            Some(sender) => sender.write(block),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// 结束输入，引擎将观察到输入结束。
    pub fn complete(&mut self) {
        self.sender = None;
    }

    /// 读取下一个出站分段；引擎关闭输出后返回 `None`。
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// 读取出站分段直到累计 `len` 字节或输出关闭。
    pub async fn recv_exact(&mut self, len: usize) -> BytesMut {
        let mut collected = BytesMut::with_capacity(len);
        while collected.len() < len {
            match self.rx.recv().await {
                Some(segment) => collected.extend_from_slice(&segment),
                None => break,
            }
        }
        collected
    }
}
