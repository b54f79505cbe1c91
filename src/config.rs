// Конфигурация звонка
// Файл: $SSC_CONFIG или ./ssc-call.toml, поверх него переменные окружения SSC_*

use crate::error::{CallError, Result};
use crate::media::MediaKind;
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

// В режиме отладки логируем всё, что касается звонка
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "ssc_call=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info,webrtc=error";

pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8787";

/// Верхняя граница для таймеров сессии (сутки)
pub const MAX_TIMER_MS: u64 = 24 * 60 * 60 * 1000;

/// Тип ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(id: &str, url: &str) -> Self {
        Self {
            id: id.into(),
            kind: IceServerKind::Stun,
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(id: &str, url: &str, username: &str, credential: &str) -> Self {
        Self {
            id: id.into(),
            kind: IceServerKind::Turn,
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// URL со схемой `stun:`/`turn:`
    pub fn normalized_urls(&self) -> Vec<String> {
        self.urls
            .iter()
            .map(|url| add_ice_url_scheme(self.kind, url))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() || self.urls.iter().any(|u| u.trim().is_empty()) {
            return Err(CallError::Config(format!(
                "ICE server {} has an empty url",
                self.id
            )));
        }
        if self.kind == IceServerKind::Turn
            && (self.username.is_none() || self.credential.is_none())
        {
            return Err(CallError::Config(format!(
                "TURN server {} requires username and credential",
                self.id
            )));
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        id: "default-stun".into(),
        kind: IceServerKind::Stun,
        urls: DEFAULT_STUN_URLS.iter().map(|u| u.to_string()).collect(),
        username: None,
        credential: None,
    }]
}

/// Параметры сессии звонка
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Сколько ждать восстановления соединения перед объявлением отказа
    pub grace_period_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Задержка перед уходом с экрана звонка после терминальной ошибки
    pub failure_exit_delay_ms: u64,
    pub tick_interval_ms: u64,
    pub media_kind: MediaKind,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            grace_period_ms: 10_000,
            max_reconnect_attempts: 3,
            failure_exit_delay_ms: 3_000,
            tick_interval_ms: 1_000,
            media_kind: MediaKind::AudioVideo,
        }
    }
}

impl CallConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn failure_exit_delay(&self) -> Duration {
        Duration::from_millis(self.failure_exit_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !self
            .ice_servers
            .iter()
            .any(|s| s.kind == IceServerKind::Stun)
        {
            return Err(CallError::Config(
                "at least one STUN server is required".into(),
            ));
        }
        for server in &self.ice_servers {
            server.validate()?;
        }
        if self.tick_interval_ms == 0 {
            return Err(CallError::Config("tick interval must be positive".into()));
        }
        for (name, value) in [
            ("grace_period_ms", self.grace_period_ms),
            ("failure_exit_delay_ms", self.failure_exit_delay_ms),
            ("tick_interval_ms", self.tick_interval_ms),
        ] {
            if value > MAX_TIMER_MS {
                return Err(CallError::Config(format!(
                    "{} must not exceed {} ms",
                    name, MAX_TIMER_MS
                )));
            }
        }
        Ok(())
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: CallConfig =
            toml::from_str(text).map_err(|e| CallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Переопределения из окружения. TURN добавляется только при полном наборе
    /// url + username + credential.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("SSC_TURN_URL") {
            match (var("SSC_TURN_USERNAME"), var("SSC_TURN_CREDENTIAL")) {
                (Some(user), Some(cred)) => {
                    self.ice_servers.retain(|s| s.id != "env-turn");
                    self.ice_servers
                        .push(IceServerConfig::turn("env-turn", &url, &user, &cred));
                }
                _ => warn!("SSC_TURN_URL is set without username/credential, ignoring"),
            }
        }
        if let Some(secs) = var("SSC_GRACE_PERIOD_SECS").and_then(|s| s.parse::<u64>().ok()) {
            self.grace_period_ms = secs.saturating_mul(1000);
        }
        if let Some(n) = var("SSC_MAX_RECONNECTS").and_then(|s| s.parse::<u32>().ok()) {
            self.max_reconnect_attempts = n;
        }
    }
}

fn config_path() -> PathBuf {
    std::env::var("SSC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ssc-call.toml"))
}

/// Загрузка: дефолты, затем файл (если есть), затем переменные окружения.
pub fn load() -> Result<CallConfig> {
    load_from(&config_path(), |name| std::env::var(name).ok())
}

fn load_from<F>(path: &Path, var: F) -> Result<CallConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!("Loading call config from {}", path.display());
            CallConfig::from_toml(&text)?
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No call config at {}, using defaults", path.display());
            CallConfig::default()
        }
        Err(e) => {
            return Err(CallError::Config(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };
    config.apply_env(var);
    config.validate()?;
    Ok(config)
}

pub fn relay_addr() -> String {
    std::env::var("SSC_RELAY_ADDR").unwrap_or_else(|_| DEFAULT_RELAY_ADDR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_public_stun() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(
            config.ice_servers[0].normalized_urls()[0],
            "stun:stun.l.google.com:19302"
        );
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut config = CallConfig::default();
        config.ice_servers.push(IceServerConfig {
            id: "t".into(),
            kind: IceServerKind::Turn,
            urls: vec!["turn.example.org:3478".into()],
            username: Some("u".into()),
            credential: None,
        });
        assert!(matches!(config.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn parses_toml_file() {
        let text = r#"
            grace_period_ms = 2500
            max_reconnect_attempts = 5

            [[ice_servers]]
            id = "stun"
            type = "stun"
            urls = ["stun.example.org:3478"]

            [[ice_servers]]
            id = "turn"
            type = "turn"
            urls = ["turn.example.org:3478"]
            username = "alice"
            credential = "secret"
        "#;
        let config = CallConfig::from_toml(text).unwrap();
        assert_eq!(config.grace_period(), Duration::from_millis(2500));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(
            config.ice_servers[1].normalized_urls(),
            vec!["turn:turn.example.org:3478".to_string()]
        );
    }

    #[test]
    fn env_adds_turn_server() {
        let env: HashMap<&str, &str> = [
            ("SSC_TURN_URL", "turn:turn.example.org:3478"),
            ("SSC_TURN_USERNAME", "bob"),
            ("SSC_TURN_CREDENTIAL", "pw"),
            ("SSC_MAX_RECONNECTS", "1"),
        ]
        .into_iter()
        .collect();
        let mut config = CallConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.max_reconnect_attempts, 1);
        let turn = config.ice_servers.iter().find(|s| s.id == "env-turn").unwrap();
        assert_eq!(turn.username.as_deref(), Some("bob"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn huge_grace_period_is_rejected_not_overflowed() {
        let mut config = CallConfig::default();
        config.apply_env(|k| (k == "SSC_GRACE_PERIOD_SECS").then(|| u64::MAX.to_string()));
        assert_eq!(config.grace_period_ms, u64::MAX);
        assert!(matches!(config.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("ssc-call-missing-config.toml");
        let config = load_from(&path, |_| None).unwrap();
        assert_eq!(config, CallConfig::default());
    }

    #[test]
    fn unreadable_file_is_an_error() {
        // каталог вместо файла: ошибка чтения, но не NotFound
        let path = std::env::temp_dir();
        assert!(matches!(
            load_from(&path, |_| None),
            Err(CallError::Config(_))
        ));
    }
}
