#![deny(unsafe_code)]
#![doc = r#"
# conduit-core

## 设计动机（Why）
- 在原始字节传输（流式套接字、数据报、内存管道）与应用会话之间提供统一的双工抽象：
  把连续或分块的字节流变为完整解码的包序列，再把包与缓冲区串行化为出站写入；
- 传输与协议都可插拔：传输只需实现 `fill`/`drain` 两个原语，协议只需实现管道过滤器契约。

## 核心契约（What）
- [`PipeConnection`]：读取-解析-入队循环、串行化写路径、`NotStarted → Running → Closing → Closed`
  生命周期与独立的分离路径；
- [`PipelineFilter`] / [`FilterGraph`]：增量解析契约，支持包含环的协议切换图；
- [`PackageStream`]：惰性、单遍、不可重启的包序列，可选按需填充策略；
- [`Connection`]：会话层使用的对象安全契约；
- [`VirtualTransport`]：内存传输，亦是数据报适配器的输入基础。

## 风险提示（Trade-offs）
- 过滤器在引擎内部任务上同步执行，耗时解析会阻塞同一连接的后续读取；
- 管道写模式下 `send` 返回只代表数据已交给写出任务。
"#]

pub mod close;
pub mod connection;
pub mod encoder;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod filter;
pub mod options;
pub mod queue;
pub mod state;
pub mod transport;
pub mod virtual_io;

pub use close::CloseReason;
pub use connection::{Connection, ConnectionId};
pub use encoder::{EncodeError, PackageEncoder};
pub use endpoint::{Endpoint, Endpoints};
pub use engine::{DetachedParts, PipeConnection};
pub use error::{ConnectionError, IoDisposition, classify_io_error};
pub use filter::{FilterContext, FilterCursor, FilterError, FilterGraph, FilterId, PipelineFilter};
pub use options::{ConnectionOptions, ConnectionOptionsBuilder, OptionsError};
pub use queue::{PackageStream, PackageWriter, QueueClosed, QueueStrategy, package_queue};
pub use state::ConnectionState;
pub use transport::{InputHalf, OutputHalf, Transport, WriteMode};
pub use virtual_io::{BlockSender, VirtualInput, VirtualOutput, VirtualPeer, VirtualTransport};

/// 虚拟传输上的引擎别名。
pub type VirtualConnection = PipeConnection<VirtualInput, VirtualOutput>;
