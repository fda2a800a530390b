//! 配置模块。
//!
//! 配置以 JSON 文件保存 (默认 `app_settings.json`，可由环境变量 `REALTIME_HUB_CONFIG` 指定)。
//! 文件不存在时使用默认配置并尝试写出一份；文件内容损坏时返回错误，不会静默覆盖。
//! 少数与部署强相关的值可以通过环境变量覆盖，见 [`AppConfig::apply_overrides`]。

use crate::error::ConfigError;
use log::{info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_CONFIG_PATH: &str = "REALTIME_HUB_CONFIG";
pub const ENV_SECRET: &str = "REALTIME_HUB_SECRET";
pub const ENV_WS_PORT: &str = "REALTIME_HUB_WS_PORT";
pub const ENV_API_PORT: &str = "REALTIME_HUB_API_PORT";

const DEFAULT_CONFIG_FILE: &str = "app_settings.json";

/// WebSocket 服务端配置。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    pub host: String,
    pub port: u16,
    /// 握手请求必须使用的路径。
    pub path: String,
    /// TCP 建立后完成 WebSocket 升级握手的时限。
    pub handshake_timeout_ms: u64,
    /// 单个帧写入套接字的时限，超时视为对端已失去响应。
    pub write_timeout_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
            path: "/ws/connect".to_string(),
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
        }
    }
}

/// 管理 HTTP 接口配置。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8089,
        }
    }
}

/// 令牌签名与校验配置。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC 签名密钥。为空时启动阶段会生成一个随机密钥。
    pub secret: String,
    pub key_id: String,
    pub token_ttl_seconds: u64,
    /// 校验过期时间时允许的时钟偏差。
    pub clock_leeway_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            key_id: "k1".to_string(),
            token_ttl_seconds: 600,
            clock_leeway_seconds: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 60_000,
        }
    }
}

/// 单个令牌桶的容量与补充速率。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_second: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub connect_per_ip: BucketConfig,
    pub connect_per_user: BucketConfig,
    pub subscribe_per_ip: BucketConfig,
    pub subscribe_per_user: BucketConfig,
    /// 已回满且闲置超过此时长的桶会在定期清理中被移除。
    pub idle_bucket_ttl_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_per_ip: BucketConfig { capacity: 20, refill_per_second: 1.0 },
            connect_per_user: BucketConfig { capacity: 10, refill_per_second: 0.5 },
            subscribe_per_ip: BucketConfig { capacity: 100, refill_per_second: 10.0 },
            subscribe_per_user: BucketConfig { capacity: 50, refill_per_second: 5.0 },
            idle_bucket_ttl_seconds: 300,
        }
    }
}

/// 资源上限。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_rooms: usize,
    pub max_rooms_per_connection: usize,
    /// 单个连接累计多少次协议错误后被关闭。
    pub protocol_error_threshold: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_rooms: 50_000,
            max_rooms_per_connection: 64,
            protocol_error_threshold: 5,
        }
    }
}

/// 慢消费者的背压策略。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BackpressureConfig {
    /// 每个连接普通通道的容量。
    pub queue_capacity: usize,
    /// 永远不会被选中丢弃的消息种类。
    pub protected_kinds: Vec<String>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            protected_kinds: ["welcome", "subscribed", "unsubscribed", "error"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// 应用的主配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub websocket: WebSocketConfig,
    pub api: ApiConfig,
    pub auth: AuthConfig,
    pub heartbeat: HeartbeatConfig,
    pub rate_limit: RateLimitConfig,
    pub limits: LimitsConfig,
    pub backpressure: BackpressureConfig,
}

impl AppConfig {
    /// 按环境变量与默认路径加载配置、应用覆盖项并校验。
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_file_path();
        let mut config = Self::load_or_create(&path)?;
        config.apply_overrides(|name| env::var(name).ok());
        config.ensure_secret();
        config.validate()?;
        Ok(config)
    }

    /// 从指定路径读取配置；文件不存在时写出默认配置。
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_json::from_str::<AppConfig>(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
                info!("[配置模块] 已成功从配置文件 {:?} 加载应用配置。", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("[配置模块] 未在 {:?} 找到配置文件，将使用默认配置并尝试创建新文件。", path);
                let config = AppConfig::default();
                save_config(&config, path);
                Ok(config)
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// 应用环境变量覆盖。`lookup` 通常是 `std::env::var`，测试中可以替换。
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_SECRET).filter(|s| !s.is_empty()) {
            self.auth.secret = secret;
        }
        if let Some(port) = lookup(ENV_WS_PORT) {
            match port.parse() {
                Ok(p) => self.websocket.port = p,
                Err(_) => warn!("[配置模块] 环境变量 {} 的值 {:?} 不是合法端口，已忽略。", ENV_WS_PORT, port),
            }
        }
        if let Some(port) = lookup(ENV_API_PORT) {
            match port.parse() {
                Ok(p) => self.api.port = p,
                Err(_) => warn!("[配置模块] 环境变量 {} 的值 {:?} 不是合法端口，已忽略。", ENV_API_PORT, port),
            }
        }
    }

    fn ensure_secret(&mut self) {
        if self.auth.secret.is_empty() {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            self.auth.secret = hex::encode(bytes);
            warn!("[配置模块] 未配置签名密钥，已生成随机密钥。进程重启后之前签发的令牌将全部失效。");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.auth.secret.is_empty() {
            return invalid("auth.secret 不能为空");
        }
        if self.auth.key_id.is_empty() {
            return invalid("auth.key_id 不能为空");
        }
        if !(300..=900).contains(&self.auth.token_ttl_seconds) {
            return invalid("auth.token_ttl_seconds 必须在 300 到 900 秒之间");
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return invalid("heartbeat.timeout_ms 必须大于 heartbeat.interval_ms 且间隔不能为 0");
        }
        if self.backpressure.queue_capacity == 0 {
            return invalid("backpressure.queue_capacity 不能为 0");
        }
        if !self.websocket.path.starts_with('/') {
            return invalid("websocket.path 必须以 / 开头");
        }
        if self.websocket.handshake_timeout_ms == 0 || self.websocket.write_timeout_ms == 0 {
            return invalid("websocket.handshake_timeout_ms 与 write_timeout_ms 不能为 0");
        }
        let buckets = [
            ("connect_per_ip", self.rate_limit.connect_per_ip),
            ("connect_per_user", self.rate_limit.connect_per_user),
            ("subscribe_per_ip", self.rate_limit.subscribe_per_ip),
            ("subscribe_per_user", self.rate_limit.subscribe_per_user),
        ];
        for (name, bucket) in buckets {
            if bucket.capacity == 0 || !(bucket.refill_per_second > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit.{} 的容量与补充速率必须为正数",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// 获取配置文件路径
fn config_file_path() -> PathBuf {
    match env::var(ENV_CONFIG_PATH) {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE),
    }
}

/// 保存配置到文件。写入失败只记录警告，不影响启动。
fn save_config(config: &AppConfig, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("[配置模块] 错误：创建配置目录 {:?} 失败: {}", parent, e);
                return;
            }
        }
    }
    match serde_json::to_string_pretty(config) {
        Ok(content) => {
            if let Err(e) = fs::write(path, content) {
                warn!("[配置模块] 错误：将配置写入文件 {:?} 时失败: {}", path, e);
            } else {
                info!("[配置模块] 已成功将默认配置保存到 {:?}.", path);
            }
        }
        Err(e) => warn!("[配置模块] 错误：序列化配置信息以便保存时失败: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.auth.secret = "unit-test-secret".into();
        config
    }

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("realtime_hub_{}_{}.json", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_defaults_are_valid_once_secret_is_set() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.websocket.port, 8088);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.heartbeat.timeout_ms, 60_000);
        assert!(AppConfig::default().validate().is_err(), "空密钥的默认配置不应通过校验");
    }

    #[test]
    /// 测试各项非法配置都会被拒绝。
    fn test_validate_rejects_bad_values() {
        let mut c = valid_config();
        c.auth.token_ttl_seconds = 60;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))), "过短的令牌有效期应被拒绝");

        let mut c = valid_config();
        c.heartbeat.timeout_ms = c.heartbeat.interval_ms;
        assert!(c.validate().is_err(), "超时不大于间隔时应被拒绝");

        let mut c = valid_config();
        c.backpressure.queue_capacity = 0;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.websocket.write_timeout_ms = 0;
        assert!(c.validate().is_err(), "写超时为 0 时应被拒绝");

        let mut c = valid_config();
        c.rate_limit.subscribe_per_user.refill_per_second = 0.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_SECRET, "from-env"),
            (ENV_WS_PORT, "9000"),
            (ENV_API_PORT, "not-a-port"),
        ]
        .into_iter()
        .collect();
        let mut c = AppConfig::default();
        c.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(c.auth.secret, "from-env");
        assert_eq!(c.websocket.port, 9000);
        assert_eq!(c.api.port, 8089, "非法端口值应被忽略");
    }

    #[test]
    /// 测试文件不存在时写出默认配置，再次加载得到同样的内容；部分字段缺省时使用默认值。
    fn test_load_or_create_roundtrip() {
        let path = temp_path("create");
        let created = AppConfig::load_or_create(&path).expect("创建默认配置失败");
        assert!(path.exists(), "默认配置应被写入磁盘");
        let loaded = AppConfig::load_or_create(&path).expect("重新加载配置失败");
        assert_eq!(created, loaded);
        let _ = fs::remove_file(&path);

        let partial = temp_path("partial");
        fs::write(&partial, r#"{"websocket": {"port": 7000}}"#).expect("写入测试文件失败");
        let c = AppConfig::load_or_create(&partial).expect("加载部分配置失败");
        assert_eq!(c.websocket.port, 7000);
        assert_eq!(c.websocket.path, "/ws/connect");
        let _ = fs::remove_file(&partial);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        fs::write(&path, "{ not json").expect("写入测试文件失败");
        assert!(matches!(AppConfig::load_or_create(&path), Err(ConfigError::Parse { .. })));
        let _ = fs::remove_file(&path);
    }
}
