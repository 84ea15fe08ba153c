use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "vcr-proxy.yaml";

pub const ALWAYS_IGNORED_HEADERS_DEFAULT: [&str; 5] = [
    "date",
    "x-request-id",
    "x-trace-id",
    "traceparent",
    "tracestate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Record,
    Replay,
    Spy,
}

impl ProxyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Replay => "replay",
            Self::Spy => "spy",
        }
    }
}

impl FromStr for ProxyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "record" => Ok(Self::Record),
            "replay" => Ok(Self::Replay),
            "spy" => Ok(Self::Spy),
            other => anyhow::bail!("invalid mode `{other}`; expected record, replay, or spy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: ProxyMode,
    pub port: u16,
    pub admin_port: u16,
    pub targets: BTreeMap<String, String>,
    pub cassettes: CassettesConfig,
    pub matching: MatchingConfig,
    #[serde(rename = "proxy_timeout")]
    pub proxy_timeout_secs: f64,
    pub max_body_size: usize,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Spy,
            port: 8080,
            admin_port: 8081,
            targets: BTreeMap::new(),
            cassettes: CassettesConfig::default(),
            matching: MatchingConfig::default(),
            proxy_timeout_secs: 30.0,
            max_body_size: 10 * 1024 * 1024,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CassettesConfig {
    pub dir: PathBuf,
    pub overwrite: bool,
}

impl Default for CassettesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cassettes"),
            overwrite: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub always_ignore_headers: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            always_ignore_headers: ALWAYS_IGNORED_HEADERS_DEFAULT
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
        }
    }
}

impl MatchingConfig {
    /// Header names excluded from every fingerprint, lowercased.
    pub fn always_ignore_headers_lc(&self) -> Vec<String> {
        self.always_ignore_headers
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

impl Config {
    /// Loads configuration: an explicit path must exist; the default path is
    /// optional and falls back to built-in defaults. Environment variables
    /// with the `VCR_` prefix override file settings either way.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let yaml = fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                Self::from_yaml_str(&yaml)?
            }
            None => match fs::read_to_string(DEFAULT_CONFIG_PATH) {
                Ok(yaml) => Self::from_yaml_str(&yaml)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
                Err(err) => {
                    return Err(err).with_context(|| format!("read config {DEFAULT_CONFIG_PATH}"));
                }
            },
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        yaml.parse()
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.proxy_timeout_secs.max(0.0))
    }

    /// Applies `VCR_`-prefixed overrides. `lookup` abstracts `std::env::var`
    /// so tests can inject values.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(mode) = lookup("VCR_MODE") {
            self.mode = mode.parse().context("parse VCR_MODE")?;
        }
        if let Some(port) = lookup("VCR_PORT") {
            self.port = port.parse().context("parse VCR_PORT")?;
        }
        if let Some(admin_port) = lookup("VCR_ADMIN_PORT") {
            self.admin_port = admin_port.parse().context("parse VCR_ADMIN_PORT")?;
        }
        if let Some(target) = lookup("VCR_TARGET") {
            self.targets = BTreeMap::from([("/".to_owned(), target)]);
        }
        if let Some(dir) = lookup("VCR_CASSETTES_DIR") {
            self.cassettes.dir = PathBuf::from(dir);
        }
        if let Some(overwrite) = lookup("VCR_CASSETTES_OVERWRITE") {
            self.cassettes.overwrite =
                parse_bool(&overwrite).context("parse VCR_CASSETTES_OVERWRITE")?;
        }
        if let Some(timeout) = lookup("VCR_PROXY_TIMEOUT") {
            self.proxy_timeout_secs = timeout.parse().context("parse VCR_PROXY_TIMEOUT")?;
        }
        if let Some(max_body_size) = lookup("VCR_MAX_BODY_SIZE") {
            self.max_body_size = max_body_size.parse().context("parse VCR_MAX_BODY_SIZE")?;
        }
        if let Some(level) = lookup("VCR_LOG_LEVEL") {
            self.logging.level = Some(level);
        }
        if let Some(format) = lookup("VCR_LOG_FORMAT") {
            self.logging.format = Some(match format.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => anyhow::bail!("invalid VCR_LOG_FORMAT `{other}`; expected json or pretty"),
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (prefix, target) in &self.targets {
            if !prefix.starts_with('/') {
                anyhow::bail!("target prefix `{prefix}` must start with `/`");
            }
            let uri: hyper::Uri = target
                .parse()
                .with_context(|| format!("parse target URL `{target}` for prefix `{prefix}`"))?;
            match uri.scheme_str() {
                Some("http") | Some("https") => {}
                _ => anyhow::bail!("target URL `{target}` must use http or https"),
            }
            if uri.authority().is_none() {
                anyhow::bail!("target URL `{target}` must include a host");
            }
        }
        if self.proxy_timeout_secs <= 0.0 {
            anyhow::bail!("proxy_timeout must be positive");
        }
        if self.max_body_size == 0 {
            anyhow::bail!("max_body_size must be positive");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s).context("parse config YAML")
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid boolean `{other}`"),
    }
}
