use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::payment::{PaymentSettings, SweeperConfig};
use crate::providers::{AlipayConfig, PaddleConfig, PayPalConfig, StripeConfig, WechatConfig};
use crate::saga::{RefundSagaSettings, RunnerConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    #[serde(default)]
    pub use_json: bool,
    /// hourly | daily | never
    #[serde(default = "default_rotation")]
    pub rotation: String,
    pub gateway: GatewayConfig,
    /// Without it payments live in memory only
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Public base URL of the API gateway, used to build notify URLs
    pub api_gateway_url: String,
    /// Browser redirect after hosted checkout
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_payment_ttl_secs")]
    pub payment_ttl_secs: u64,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub saga: SagaConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExpiryConfig {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SagaConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Finished saga records are dropped after this long
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_retries: 3,
            retry_delay_ms: 500,
            record_ttl_secs: default_record_ttl_secs(),
        }
    }
}

/// Balance ledger service
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LedgerConfig {
    /// Without it an in-memory ledger is used (local runs only)
    pub base_url: Option<String>,
    #[serde(default = "default_ledger_timeout_ms")]
    pub timeout_ms: u64,
}

/// Gateway credentials. A missing section selects the stub adapter.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    pub wechat: Option<WechatConfig>,
    pub alipay: Option<AlipayConfig>,
    pub stripe: Option<StripeConfig>,
    pub paypal: Option<PayPalConfig>,
    pub paddle: Option<PaddleConfig>,
    /// Shared secret of the stub adapters
    #[serde(default = "default_stub_secret")]
    pub stub_secret: String,
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_currency() -> String {
    "CNY".to_string()
}

fn default_payment_ttl_secs() -> u64 {
    900
}

fn default_record_ttl_secs() -> u64 {
    3_600
}

fn default_ledger_timeout_ms() -> u64 {
    5_000
}

fn default_stub_secret() -> String {
    "stub-secret".to_string()
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_gateway_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api_gateway_url must be set".into()));
        }
        if self.payment_ttl_secs == 0 {
            return Err(ConfigError::Invalid("payment_ttl_secs must be > 0".into()));
        }
        if self.expiry.batch_size == 0 {
            return Err(ConfigError::Invalid("expiry.batch_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn payment_settings(&self) -> PaymentSettings {
        PaymentSettings {
            currency: self.currency.clone(),
            ttl: chrono::Duration::seconds(self.payment_ttl_secs as i64),
            api_gateway_url: self.api_gateway_url.trim_end_matches('/').to_string(),
            return_url: self.return_url.clone(),
            saga: RefundSagaSettings {
                timeout_ms: self.saga.timeout_ms,
                max_retries: self.saga.max_retries,
            },
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            retry_delay: Duration::from_millis(self.saga.retry_delay_ms),
            record_ttl: Duration::from_secs(self.saga.record_ttl_secs),
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            scan_interval: Duration::from_secs(self.expiry.scan_interval_secs),
            batch_size: self.expiry.batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: billing.log
gateway:
  host: 0.0.0.0
  port: 8090
api_gateway_url: https://api.example.com/
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.currency, "CNY");
        assert_eq!(config.payment_ttl_secs, 900);
        assert_eq!(config.saga.max_retries, 3);
        assert!(config.postgres_url.is_none());
        assert!(config.providers.wechat.is_none());

        let settings = config.payment_settings();
        assert_eq!(settings.api_gateway_url, "https://api.example.com");
        assert_eq!(settings.ttl, chrono::Duration::minutes(15));
        assert_eq!(settings.saga.timeout_ms, 300_000);
        assert_eq!(config.sweeper_config().batch_size, 100);
        assert_eq!(config.runner_config().record_ttl, Duration::from_secs(3_600));
    }

    #[test]
    fn test_saga_section_without_record_ttl() {
        let yaml = format!(
            "{}saga:\n  timeout_ms: 1000\n  max_retries: 0\n  retry_delay_ms: 10\n",
            MINIMAL
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.saga.record_ttl_secs, 3_600);
        assert_eq!(config.payment_settings().saga.max_retries, 0);
    }

    #[test]
    fn test_provider_section() {
        let yaml = format!(
            "{}providers:\n  stripe:\n    secret_key: sk_test\n    publishable_key: pk_test\n    webhook_secret: whsec\n    success_url: https://x/ok\n    cancel_url: https://x/cancel\n",
            MINIMAL
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        let stripe = config.providers.stripe.unwrap();
        assert_eq!(stripe.secret_key, "sk_test");
        assert_eq!(stripe.mode, crate::providers::ProviderMode::Sandbox);
        assert!(config.providers.paypal.is_none());
    }

    #[test]
    fn test_invalid_ttl_rejected() {
        let yaml = format!("{}payment_ttl_secs: 0\n", MINIMAL);
        assert!(matches!(
            AppConfig::from_yaml(&yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AppConfig::load("does-not-exist"),
            Err(ConfigError::Read { .. })
        ));
    }
}
