//! 统一配置中心
//!
//! 加载顺序：内置默认值 → `APP_CONFIG_FILE` 指定的文件（toml / yaml / json）
//! → `APP_` 前缀的环境变量（`APP_PRESENCE__TTL_SECONDS=30`）。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 每纬度对应的近似米数
const METERS_PER_DEGREE: f64 = 111_320.0;

/// 单次附近查询允许扫描的最多网格数（赤道附近估算）
pub const MAX_SCAN_CELLS: f64 = 10_000.0;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub jwt: JwtConfig,
    #[validate(nested)]
    pub presence: PresenceConfig,
    #[validate(nested)]
    pub messaging: MessagingConfig,
    #[validate(nested)]
    pub broker: BrokerConfig,
    #[validate(nested)]
    pub session: SessionConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// 数据库配置；未设置 `url` 时使用内存存储
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    #[validate(length(min = 32, message = "JWT secret must be at least 32 characters long"))]
    pub secret: String,
    #[validate(range(min = 1))]
    pub expiration_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PresenceConfig {
    #[validate(range(min = 1))]
    pub ttl_seconds: u64,
    /// 0 表示 ttl 的一半
    #[serde(default)]
    pub sweep_interval_seconds: u64,
    #[validate(range(min = 0.001, max = 10.0))]
    pub cell_size_degrees: f64,
    #[validate(range(min = 1.0, max = 200_000.0))]
    pub max_radius_meters: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MessagingConfig {
    #[validate(range(min = 1))]
    pub max_body_chars: usize,
    /// 0 表示不限流
    #[serde(default)]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BrokerConfig {
    #[validate(range(min = 1))]
    pub mailbox_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SessionConfig {
    #[validate(range(min = 1))]
    pub auth_timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub heartbeat_timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
                cors_origins: vec!["*".into()],
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
            },
            jwt: JwtConfig {
                secret: String::new(),
                expiration_hours: 24,
            },
            presence: PresenceConfig {
                ttl_seconds: 60,
                sweep_interval_seconds: 0,
                cell_size_degrees: 0.05,
                max_radius_meters: 50_000.0,
            },
            messaging: MessagingConfig {
                max_body_chars: 4000,
                rate_limit_per_minute: 60,
            },
            broker: BrokerConfig {
                mailbox_capacity: 256,
            },
            session: SessionConfig {
                auth_timeout_seconds: 10,
                heartbeat_timeout_seconds: 60,
                request_timeout_ms: 5000,
            },
        }
    }
}

impl AppConfig {
    /// 默认值 → 可选文件 → 环境变量
    pub fn figment() -> Figment {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig.merge(Env::prefixed("APP_").split("__"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment
            .extract()
            .map_err(|err| ConfigError::Load(Box::new(err)))?;
        config.validate()?;
        Ok(config)
    }

    /// 字段级校验之外的安全检查
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self)?;

        if self.jwt.secret.contains("dev-secret")
            || self.jwt.secret.contains("not-for-production")
            || self.jwt.secret.contains("please-change")
        {
            return Err(ConfigError::InvalidJwtSecret(
                "Cannot use development JWT secret in production".to_string(),
            ));
        }

        if let Some(url) = &self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(ConfigError::InvalidDatabaseUrl(
                    "Database URL must use the postgres scheme".to_string(),
                ));
            }
        }

        if self.presence.sweep_interval_seconds > self.presence.ttl_seconds {
            return Err(ConfigError::InvalidPresenceConfig(
                "sweep interval must not exceed the presence ttl".to_string(),
            ));
        }

        // 客户端按格快照时用外接圆半径查询，必须落在允许的半径内
        if self.presence.cell_circumradius_meters() > self.presence.max_radius_meters {
            return Err(ConfigError::InvalidPresenceConfig(format!(
                "max radius {} m is smaller than one cell's circumradius {:.0} m",
                self.presence.max_radius_meters,
                self.presence.cell_circumradius_meters()
            )));
        }

        if self.presence.max_scan_cells() > MAX_SCAN_CELLS {
            return Err(ConfigError::InvalidPresenceConfig(format!(
                "max radius {} m scans about {:.0} cells of {} degrees, limit is {}",
                self.presence.max_radius_meters,
                self.presence.max_scan_cells(),
                self.presence.cell_size_degrees,
                MAX_SCAN_CELLS
            )));
        }

        Ok(())
    }

    /// 用于日志输出，隐藏密钥和数据库口令
    pub fn sanitize(&self) -> String {
        let mut redacted = self.clone();
        redacted.jwt.secret = "[REDACTED]".into();
        if redacted.database.url.is_some() {
            redacted.database.url = Some("postgres://[REDACTED]".into());
        }
        format!("{redacted:?}")
    }
}

impl PresenceConfig {
    /// 赤道处单个网格的外接圆半径，纬度越高越小
    pub fn cell_circumradius_meters(&self) -> f64 {
        self.cell_size_degrees * METERS_PER_DEGREE * std::f64::consts::FRAC_1_SQRT_2
    }

    /// 最大半径查询覆盖的网格数，含边界外一圈邻格
    pub fn max_scan_cells(&self) -> f64 {
        let cell_meters = self.cell_size_degrees * METERS_PER_DEGREE;
        let side = (2.0 * self.max_radius_meters / cell_meters).ceil() + 3.0;
        side * side
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        if self.sweep_interval_seconds == 0 {
            Duration::from_millis(self.ttl_seconds * 500).max(Duration::from_millis(500))
        } else {
            Duration::from_secs(self.sweep_interval_seconds)
        }
    }
}

impl SessionConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid presence configuration: {0}")]
    InvalidPresenceConfig(String),
}
