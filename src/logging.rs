use std::str::FromStr;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Target that carries queue, scheduler and worker logs.
const ENGINE_TARGET: &str = "sentinel_backend::services";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("Unknown LOG_FORMAT: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub loki_enabled: bool,
    pub loki_url: Option<String>,
    pub service_name: String,
    pub environment: String,
    pub log_level: String,
    pub format: LogFormat,
    /// Overrides the level for job engine internals only.
    pub engine_log_level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            loki_enabled: false,
            loki_url: None,
            service_name: "sentinel".to_string(),
            environment: "development".to_string(),
            log_level: "info".to_string(),
            format: LogFormat::Compact,
            engine_log_level: None,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            loki_enabled: std::env::var("LOKI_ENABLED")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            loki_url: std::env::var("LOKI_URL").ok().filter(|url| !url.trim().is_empty()),
            service_name: std::env::var("SERVICE_NAME").unwrap_or(defaults.service_name),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            format: std::env::var("LOG_FORMAT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.format),
            engine_log_level: std::env::var("JOB_ENGINE_LOG").ok(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.loki_enabled && self.loki_url.is_none() {
            return Err("LOKI_ENABLED is true but LOKI_URL is not set".to_string());
        }
        self.filter().map(|_| ())
    }

    /// `RUST_LOG` plus the engine override, with HTTP plumbing kept at warn.
    pub fn filter(&self) -> Result<EnvFilter, String> {
        let mut directives = vec![self.log_level.clone(), "hyper=warn".to_string(), "tower_http=warn".to_string()];
        if let Some(level) = &self.engine_log_level {
            directives.push(format!("{}={}", ENGINE_TARGET, level));
        }
        EnvFilter::try_new(directives.join(",")).map_err(|e| format!("Invalid log filter: {}", e))
    }
}

pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    #[cfg(feature = "loki")]
    {
        if config.loki_enabled {
            if let Some(loki_url) = config.loki_url.clone() {
                return init_with_loki(config, &loki_url);
            }
        }
    }

    tracing_subscriber::registry()
        .with(config.filter()?)
        .with(fmt_layer(config.format))
        .try_init()?;

    tracing::info!(format = ?config.format, "📊 Console logging initialized");
    Ok(())
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    }
}

#[cfg(feature = "loki")]
fn init_with_loki(config: LoggingConfig, loki_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = url::Url::parse(loki_url)?;

    let (loki_layer, task) = tracing_loki::builder()
        .label("service", &config.service_name)?
        .label("environment", &config.environment)?
        .build_url(url)?;

    // Ships log batches to Loki until the runtime stops
    tokio::spawn(task);

    tracing_subscriber::registry()
        .with(config.filter()?)
        .with(fmt_layer(config.format))
        .with(loki_layer)
        .try_init()?;

    tracing::info!(loki_url = %loki_url, service = %config.service_name, "✅ Loki logging initialized");

    Ok(())
}
