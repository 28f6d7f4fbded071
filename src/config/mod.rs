use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::error::{Error, Result};

/// DashScope 默认地址
pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com";

/// 适配器网关的主配置结构
/// 包含服务器、供应商、代理和流式处理等各个模块的配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// 服务器相关配置
    pub server: ServerConfig,
    /// 上游供应商配置
    pub provider: ProviderConfig,
    /// 代理转发配置
    pub proxy: ProxyConfig,
    /// 流式处理配置
    #[serde(default)]
    pub stream: StreamConfig,
}

/// 服务器配置
/// 定义HTTP服务器的监听地址和端口
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// 服务器监听地址，例如 "0.0.0.0" 或 "127.0.0.1"
    pub host: String,
    /// 服务器监听端口，默认为8080
    pub port: u16,
}

/// 供应商（渠道）配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// DashScope 基础URL，末尾斜杠会被忽略
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 渠道密钥，以 `Authorization: Bearer <key>` 发送
    pub api_key: String,
    /// 渠道级插件配置，原样放入 `X-DashScope-Plugin` 请求头
    #[serde(default)]
    pub plugin: Option<String>,
    /// 请求体的输入形式
    #[serde(default)]
    pub request_mode: RequestMode,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// 请求输入形式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    /// 带角色的多轮消息列表
    #[default]
    Messages,
    /// 旧的单 prompt 形式，取最后一条非空消息的文本
    Prompt,
}

/// 代理配置
/// 用于配置HTTP代理转发的相关参数
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// 非流式请求超时时间，流式客户端不设全局超时
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// 每个主机的最大空闲连接数
    pub max_connections: usize,
    /// 是否启用TCP Keep-Alive
    pub keep_alive: bool,
}

/// 流式处理配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// 生产者与消费者之间有界通道的容量
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    32
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Config {
    /// 从配置文件加载配置
    ///
    /// # 参数
    /// * `path` - 配置文件路径（支持YAML、TOML、JSON等格式）
    ///
    /// # 说明
    /// 1. 首先从指定文件加载配置
    /// 2. 然后从环境变量覆盖配置（前缀为GATEWAY，分隔符为__）
    ///    例如：GATEWAY__PROVIDER__API_KEY=sk-xxx 会覆盖 provider.api_key
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::finish(settings)
    }

    /// 从字符串加载配置，不读取环境变量
    pub fn from_content(content: &str, format: config::FileFormat) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, format))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Self::finish(settings)
    }

    fn finish(settings: config::Config) -> Result<Self> {
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.provider.base_url.trim().is_empty() {
            return Err(Error::Config("provider.base_url must not be empty".into()));
        }
        if self.stream.channel_capacity == 0 {
            return Err(Error::Config("stream.channel_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    /// # 默认值
    /// - 服务器：监听 0.0.0.0:8080
    /// - 供应商：DashScope 公网地址，密钥为空，消息模式
    /// - 代理：超时60秒，最大100连接，启用Keep-Alive
    /// - 流式：通道容量32
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            provider: ProviderConfig {
                base_url: default_base_url(),
                api_key: String::new(),
                plugin: None,
                request_mode: RequestMode::Messages,
            },
            proxy: ProxyConfig {
                timeout: Duration::from_secs(60),
                max_connections: 100,
                keep_alive: true,
            },
            stream: StreamConfig::default(),
        }
    }
}
