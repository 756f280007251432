// Конфигурация звонка
// Логирование в release по умолчанию почти выключено, RUST_LOG его переопределяет

use crate::error::{CallError, Result};
use crate::media::{DeviceClass, MediaConstraints};
use crate::peer::sdp::{BandwidthLimits, SdpPreferences};
use crate::peer::state::RecoveryPolicy;
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[cfg(debug_assertions)]
const LOG_FILTER: &str = "ssc_call=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
const LOG_FILTER: &str = "ssc_call=info,webrtc=error";

pub fn default_log_filter() -> &'static str {
    LOG_FILTER
}

/// Публичные STUN серверы, если пользователь не задал свои
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-backup".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_ICE_SERVERS.clone()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Синтетические источники вместо устройств
    pub test_mode: bool,
    pub device_class: DeviceClass,
    pub video_bandwidth_kbps: u32,
    pub audio_bandwidth_kbps: u32,
    pub preferred_video_codec: String,
    pub preferred_audio_codec: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let limits = BandwidthLimits::default();
        Self {
            test_mode: false,
            device_class: DeviceClass::Desktop,
            video_bandwidth_kbps: limits.video_kbps,
            audio_bandwidth_kbps: limits.audio_kbps,
            preferred_video_codec: "VP8".into(),
            preferred_audio_codec: "opus".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub ice_restart_delay_ms: u64,
    pub peer_eviction_delay_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ice_restart_delay_ms: 3000,
            peer_eviction_delay_ms: 10_000,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 5000,
            max_reconnect_attempts: 3,
        }
    }
}

impl RecoveryConfig {
    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            ice_restart_delay: Duration::from_millis(self.ice_restart_delay_ms),
            peer_eviction_delay: Duration::from_millis(self.peer_eviction_delay_ms),
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<ServerConfig>,
    pub media: MediaConfig,
    pub recovery: RecoveryConfig,
    pub quality_interval_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            media: MediaConfig::default(),
            recovery: RecoveryConfig::default(),
            quality_interval_ms: 1000,
        }
    }
}

impl CallConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Читает флаги из query-строки страницы (`?test=1`)
    pub fn apply_query(&mut self, query: &str) {
        let query = query.trim_start_matches('?');
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "test" {
                self.media.test_mode = matches!(value.as_ref(), "" | "1" | "true" | "yes");
                debug!("Test mode from query: {}", self.media.test_mode);
            }
        }
    }

    /// Проверка ICE серверов: непустой url, у TURN есть логин и пароль.
    /// Адреса без схемы дополняются схемой по типу.
    pub fn validate(&mut self) -> Result<()> {
        for server in &mut self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(CallError::Config(format!(
                    "ICE server '{}': URL cannot be empty",
                    server.id
                )));
            }
            match server.r#type.as_str() {
                "stun" => {}
                "turn" => {
                    if server.username.is_none() || server.credential.is_none() {
                        return Err(CallError::Config(format!(
                            "ICE server '{}': TURN servers require username and credential",
                            server.id
                        )));
                    }
                }
                other => {
                    return Err(CallError::Config(format!(
                        "ICE server '{}': unknown type '{other}'",
                        server.id
                    )))
                }
            }
            server.url = add_ice_url_scheme(server);
        }
        if self.recovery.max_reconnect_attempts == 0 {
            return Err(CallError::Config(
                "max_reconnect_attempts must be at least 1".into(),
            ));
        }
        if self.quality_interval_ms == 0 {
            return Err(CallError::Config("quality_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn quality_interval(&self) -> Duration {
        Duration::from_millis(self.quality_interval_ms)
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints::for_device(self.media.device_class)
    }

    pub fn sdp_preferences(&self) -> SdpPreferences {
        SdpPreferences {
            bandwidth: BandwidthLimits {
                video_kbps: self.media.video_bandwidth_kbps,
                audio_kbps: self.media.audio_bandwidth_kbps,
            },
            video_codec: self.media.preferred_video_codec.clone(),
            audio_codec: self.media.preferred_audio_codec.clone(),
        }
    }
}
