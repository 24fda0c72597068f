use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 默认最大包长度：1 MiB。
pub const DEFAULT_MAX_PACKAGE_LENGTH: usize = 1024 * 1024;
/// 默认收发缓冲区大小：4 KiB。
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// 配置加载或校验失败。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OptionsError {
    #[error("failed to parse connection options: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} must be greater than zero")]
    ZeroBufferSize { field: &'static str },
}

/// `ConnectionOptions` 是连接构造期一次性消费的配置面。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎本身不读取任何外部配置源，宿主将配置反序列化为该结构后注入，保持引擎与配置系统解耦；
/// - 所有字段均带默认值，部分配置文档（如只声明 `read_as_demand = true`）即可生效。
///
/// ## 逻辑（How）
/// - 通过 `serde` 反序列化，`#[serde(default)]` 保证缺失字段回落到 [`Default`]；
/// - `values` 是自由形式的字符串映射，承载传输特有开关（例如数据报传输的 `enableSendingPipe`）；
/// - `span` 是可选的父级 `tracing::Span`，即注入的“日志句柄”，不参与反序列化。
///
/// ## 契约（What）
/// - `max_package_length == 0` 表示不限长；
/// - `receive_timeout_ms`/`send_timeout_ms` 为 0 表示不设超时；
/// - 缓冲区大小必须大于 0，由 [`ConnectionOptions::validate`] 校验。
///
/// ## 风险（Trade-offs）
/// - `values` 不做类型校验，拼写错误的键会被静默忽略；需要强类型的开关应提升为正式字段。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub max_package_length: usize,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub read_as_demand: bool,
    pub receive_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub values: HashMap<String, String>,
    #[serde(skip)]
    pub span: Option<tracing::Span>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_package_length: DEFAULT_MAX_PACKAGE_LENGTH,
            receive_buffer_size: DEFAULT_BUFFER_SIZE,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            read_as_demand: false,
            receive_timeout_ms: 0,
            send_timeout_ms: 0,
            values: HashMap::new(),
            span: None,
        }
    }
}

impl ConnectionOptions {
    pub fn builder() -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder::default()
    }

    /// 从 TOML 文本加载并校验配置。
    pub fn from_toml_str(source: &str) -> Result<Self, OptionsError> {
        let options: ConnectionOptions = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.receive_buffer_size == 0 {
            return Err(OptionsError::ZeroBufferSize {
                field: "receive_buffer_size",
            });
        }
        if self.send_buffer_size == 0 {
            return Err(OptionsError::ZeroBufferSize {
                field: "send_buffer_size",
            });
        }
        Ok(())
    }

    /// 字段是公开的，绕过构建器写入的零缓冲区大小在引擎构造时回落到默认值。
    pub(crate) fn normalized(mut self) -> Self {
        if let Err(error) = self.validate() {
            tracing::warn!(error = %error, default = DEFAULT_BUFFER_SIZE, "buffer size replaced by default");
        }
        if self.receive_buffer_size == 0 {
            self.receive_buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.send_buffer_size == 0 {
            self.send_buffer_size = DEFAULT_BUFFER_SIZE;
        }
        self
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        (self.receive_timeout_ms > 0).then(|| Duration::from_millis(self.receive_timeout_ms))
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_ms > 0).then(|| Duration::from_millis(self.send_timeout_ms))
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// 读取布尔开关，`true`/`false` 不区分大小写；缺失或无法识别时返回 `None`。
    pub fn value_flag(&self, key: &str) -> Option<bool> {
        let raw = self.value(key)?.trim();
        if raw.eq_ignore_ascii_case("true") {
            Some(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            None
        }
    }
}

/// [`ConnectionOptions`] 的链式构建器。
#[derive(Debug, Default)]
pub struct ConnectionOptionsBuilder {
    options: ConnectionOptions,
}

impl ConnectionOptionsBuilder {
    pub fn max_package_length(mut self, length: usize) -> Self {
        self.options.max_package_length = length;
        self
    }

    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.options.receive_buffer_size = size;
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.options.send_buffer_size = size;
        self
    }

    pub fn read_as_demand(mut self, enabled: bool) -> Self {
        self.options.read_as_demand = enabled;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.options.receive_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.options.send_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.values.insert(key.into(), value.into());
        self
    }

    pub fn span(mut self, span: tracing::Span) -> Self {
        self.options.span = Some(span);
        self
    }

    pub fn build(self) -> Result<ConnectionOptions, OptionsError> {
        self.options.validate()?;
        Ok(self.options)
    }
}
