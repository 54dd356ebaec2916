use std::{
    env,
    fmt::Debug,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Conf {
    #[serde(
        serialize_with = "serialize_log_level",
        deserialize_with = "deserialize_log_level"
    )]
    pub log_level: tracing::Level,
    pub addr: IpAddr,
    pub port: u16,
    pub database_url: String,
    pub sqlite_busy_timeout: f32,
    pub bcrypt_cost: u32,
    pub cors_origins: Vec<String>,
    pub session: ConfSession,
    pub quota: ConfQuota,
    pub generator: ConfGenerator,
    pub tls: Option<Tls>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: tracing::Level::INFO,
            addr: "127.0.0.1".parse().unwrap_or_else(|_| {
                unreachable!("Fat-fingered default IP address!")
            }),
            port: 5000,
            database_url: "sqlite://data/data.db".to_string(),
            sqlite_busy_timeout: 60.0,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            cors_origins: vec!["http://localhost:3000".to_string()],
            session: ConfSession::default(),
            quota: ConfQuota::default(),
            generator: ConfGenerator::default(),
            tls: None,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct Tls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConfSession {
    pub cookie_name: String,

    /// Adds the `Secure` attribute. Turn on when serving over TLS.
    pub cookie_secure: bool,

    /// Seconds a session lives after it was last written, i.e. since login.
    pub inactivity_timeout: f32,

    /// Seconds between sweeps of expired sessions.
    pub sweep_interval: f32,
}

impl Default for ConfSession {
    fn default() -> Self {
        Self {
            cookie_name: "sufuria_session".to_string(),
            cookie_secure: false,
            inactivity_timeout: 7.0 * 24.0 * 3600.0,
            sweep_interval: 300.0,
        }
    }
}

impl ConfSession {
    pub fn inactivity(&self) -> anyhow::Result<time::Duration> {
        let timeout = secs(self.inactivity_timeout)
            .context(format!(
                "Invalid session inactivity_timeout: {}",
                self.inactivity_timeout
            ))?;
        Ok(time::Duration::try_from(timeout)?)
    }

    pub fn sweep_period(&self) -> anyhow::Result<Duration> {
        secs(self.sweep_interval).context(format!(
            "Invalid session sweep_interval: {}",
            self.sweep_interval
        ))
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConfQuota {
    pub daily_limit: u32,
    pub paywall_amount: String,
    pub checkout_base: String,
}

impl Default for ConfQuota {
    fn default() -> Self {
        Self {
            daily_limit: 5,
            paywall_amount: "50".to_string(),
            checkout_base: "https://pay.intasend.com/checkout".to_string(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct ConfGenerator {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,

    /// Seconds.
    pub timeout: f32,

    /// Upper bound on recipes asked for in a single request.
    pub max_recipes: u32,
}

impl Default for ConfGenerator {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 800,
            timeout: 30.0,
            max_recipes: 10,
        }
    }
}

impl Debug for ConfGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let api_key = if self.api_key.is_empty() {
            "<unset>"
        } else {
            "<XXXXX>"
        };
        f.debug_struct("ConfGenerator")
            .field("api_url", &self.api_url)
            .field("api_key", &api_key)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("max_recipes", &self.max_recipes)
            .finish()
    }
}

impl Conf {
    pub fn busy_timeout(&self) -> anyhow::Result<Duration> {
        Duration::try_from_secs_f32(self.sqlite_busy_timeout).context(format!(
            "Invalid sqlite_busy_timeout: {}",
            self.sqlite_busy_timeout
        ))
    }

    /// Overrides file settings with whatever the process environment sets.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_key) = var("OPENAI_API_KEY") {
            self.generator.api_key = api_key.trim().to_string();
        }
        if let Some(model) = var("OPENAI_MODEL") {
            self.generator.model = model;
        }
        if let Some(api_url) = var("OPENAI_API_URL") {
            self.generator.api_url = api_url;
        }
        if let Some(limit) = var("DAILY_LIMIT") {
            self.quota.daily_limit = parse_var("DAILY_LIMIT", &limit)?;
        }
        if let Some(amount) = var("PAYWALL_AMOUNT") {
            self.quota.paywall_amount = amount;
        }
        if let Some(base) = var("CHECKOUT_BASE") {
            self.quota.checkout_base = base;
        }
        if let Some(url) = var("DATABASE_URL") {
            let url = url.trim();
            if !url.is_empty() {
                self.database_url = url.to_string();
            }
        }
        if let Some(port) = var("PORT") {
            self.port = parse_var("PORT", &port)?;
        }
        if let Some(origins) = var("CORS_ORIGINS") {
            self.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }
}

/// Positive, finite seconds.
fn secs(value: f32) -> anyhow::Result<Duration> {
    let duration = Duration::try_from_secs_f32(value)?;
    anyhow::ensure!(!duration.is_zero(), "must be greater than zero");
    Ok(duration)
}

fn parse_var<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .context(format!("Invalid value in environment variable {name}: {value:?}"))
}

fn serialize_log_level<S>(
    level: &tracing::Level,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let s = level.to_string();
    serializer.serialize_str(&s)
}

fn deserialize_log_level<'de, D>(
    deserializer: D,
) -> Result<tracing::Level, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let s = String::deserialize(deserializer)?;
    tracing::Level::from_str(&s).map_err(serde::de::Error::custom)
}

/// Reads `conf/conf.toml` (writing defaults if absent), then applies the
/// environment, including a `.env` file if one is found.
pub fn load() -> anyhow::Result<Conf> {
    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            return Err(error).context("Failed to read .env file");
        }
    }
    let mut conf = read_or_create_default()?;
    conf.apply_env()?;
    Ok(conf)
}

pub fn read_or_create_default() -> anyhow::Result<Conf> {
    let path = "conf/conf.toml";
    read_or_create_default_(path).context(path)
}

pub fn read_or_create_default_<P: AsRef<Path>>(
    path: P,
) -> anyhow::Result<Conf> {
    let path = path.as_ref();
    let conf = if fs::exists(path)? {
        let s = fs::read_to_string(path)?;
        toml::from_str(&s)?
    } else {
        if let Some(parent) = path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for conf file: {path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let conf = Conf::default();
        let s = toml::to_string_pretty(&conf)?;
        fs::write(path, s)?;
        conf
    };
    Ok(conf)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_written_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("conf.toml");
        let conf = read_or_create_default_(&path).unwrap();
        assert!(path.exists());
        assert_eq!(conf.quota.daily_limit, 5);

        let reread = read_or_create_default_(&path).unwrap();
        assert_eq!(reread.port, conf.port);
        assert_eq!(reread.generator.model, "gpt-4o-mini");
    }

    #[test]
    fn partial_file_filled_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.toml");
        fs::write(&path, "port = 8080\n[quota]\ndaily_limit = 2\n").unwrap();
        let conf = read_or_create_default_(&path).unwrap();
        assert_eq!(conf.port, 8080);
        assert_eq!(conf.quota.daily_limit, 2);
        assert_eq!(conf.quota.paywall_amount, "50");
        assert_eq!(conf.log_level, tracing::Level::INFO);
    }

    #[test]
    fn env_overrides() {
        let mut conf = Conf::default();
        conf.apply_env_from(env_of(&[
            ("OPENAI_API_KEY", " sk-test \n"),
            ("DAILY_LIMIT", "12"),
            ("PAYWALL_AMOUNT", "100"),
            ("DATABASE_URL", "sqlite://elsewhere.db"),
            ("CORS_ORIGINS", "http://a.test, http://b.test,"),
        ]))
        .unwrap();
        assert_eq!(conf.generator.api_key, "sk-test");
        assert_eq!(conf.quota.daily_limit, 12);
        assert_eq!(conf.quota.paywall_amount, "100");
        assert_eq!(conf.database_url, "sqlite://elsewhere.db");
        assert_eq!(conf.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(conf.port, Conf::default().port);
    }

    #[test]
    fn env_blank_database_url_ignored() {
        let mut conf = Conf::default();
        conf.apply_env_from(env_of(&[("DATABASE_URL", "  ")])).unwrap();
        assert_eq!(conf.database_url, Conf::default().database_url);
    }

    #[test]
    fn env_malformed_number_rejected() {
        let mut conf = Conf::default();
        let result = conf.apply_env_from(env_of(&[("DAILY_LIMIT", "five")]));
        assert!(result.is_err());
    }

    #[test]
    fn busy_timeout_validated() {
        let mut conf = Conf::default();
        assert_eq!(conf.busy_timeout().unwrap(), Duration::from_secs(60));
        conf.sqlite_busy_timeout = -1.0;
        let error = conf.busy_timeout().unwrap_err();
        assert_eq!(error.to_string(), "Invalid sqlite_busy_timeout: -1");
    }

    #[test]
    fn session_durations() {
        let mut session = ConfSession::default();
        assert_eq!(session.inactivity().unwrap(), time::Duration::days(7));
        assert_eq!(session.sweep_period().unwrap(), Duration::from_secs(300));
        session.inactivity_timeout = 0.0;
        assert!(session.inactivity().is_err());
        session.sweep_interval = f32::NAN;
        assert!(session.sweep_period().is_err());
    }

    #[test]
    fn api_key_redacted() {
        let mut conf = Conf::default();
        conf.generator.api_key = "sk-very-secret".to_string();
        let shown = format!("{conf:?}");
        assert!(!shown.contains("sk-very-secret"));
        assert!(shown.contains("<XXXXX>"));
    }
}
