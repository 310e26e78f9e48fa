use config::{Config, ConfigError, Environment, File};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 전체 Stampede 프로젝트를 위한 통합 환경 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedeConfig {
    pub net: NetConfig,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Host the agents connect back to.
    pub master_host: String,
    /// Orchestrator -> agent command link.
    pub down_port: u16,
    /// Agent -> orchestrator report link.
    pub up_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub discovery_window_ms: u64,
    pub strobe_interval_ms: u64,
    pub reconcile_tick_ms: u64,
    pub metrics_interval_ms: u64,
    pub drain_poll_ms: u64,
    pub default_repeat_delay_ms: u64,
    /// An agent is logged as silent after this many missed metrics intervals.
    pub liveness_warn_intervals: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: String,
    pub filename: String,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            net: NetConfig {
                master_host: "127.0.0.1".to_string(),
                down_port: 9410,
                up_port: 9411,
            },
            timing: TimingConfig {
                discovery_window_ms: 3000,
                strobe_interval_ms: 100,
                reconcile_tick_ms: 100,
                metrics_interval_ms: 5000,
                drain_poll_ms: 100,
                default_repeat_delay_ms: 1000,
                liveness_warn_intervals: 3,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                directory: "logs".to_string(),
                filename: "stampede.log".to_string(),
            },
        }
    }
}

static CONFIG: Lazy<StampedeConfig> = Lazy::new(|| {
    StampedeConfig::load().unwrap_or_else(|e| {
        warn!("Failed to load config: {}. Using defaults.", e);
        StampedeConfig::default()
    })
});

impl StampedeConfig {
    /// 전역 설정 인스턴스 가져오기
    pub fn global() -> &'static StampedeConfig {
        &CONFIG
    }

    /// 설정 파일 로드: 기본값 -> stampede.toml -> STAMPEDE_* 환경 변수
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name("stampede").required(false))
            .add_source(Environment::with_prefix("STAMPEDE").separator("__"))
            .build()?;

        let config: StampedeConfig = settings.try_deserialize()?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// 테스트 환경용 설정 생성: 짧은 탐색/보고 주기
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.timing.discovery_window_ms = 500;
        config.timing.strobe_interval_ms = 50;
        config.timing.metrics_interval_ms = 500;
        config.logging.level = "debug".to_string();
        config
    }
}

/// 설정 초기화 함수
pub fn init() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = StampedeConfig::global();
    info!("Stampede configuration initialized");
    debug!("Configuration: {:?}", config);

    Ok(())
}
