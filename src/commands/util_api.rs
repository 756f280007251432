use crate::config::{CallConfig, DEFAULT_ICE_SERVERS};
use crate::error::Result;
use crate::peer::ice::probe_ice_server;
use crate::peer::types::ServerConfig;
use crate::utils::random_id;
use tracing::{info, warn};

/// Проверка доступности ICE сервера
pub async fn check_ice_server_availability(config: ServerConfig) -> bool {
    match probe_ice_server(&config).await {
        Ok(available) => {
            info!("ICE server '{}' available: {available}", config.id);
            available
        }
        Err(e) => {
            warn!("ICE server '{}' probe failed: {e}", config.id);
            false
        }
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_ICE_SERVERS.clone()
}

/// Проверяет список серверов и возвращает его с нормализованными адресами
pub fn validate_ice_servers(servers: Vec<ServerConfig>) -> Result<Vec<ServerConfig>> {
    let mut config = CallConfig {
        ice_servers: servers,
        ..CallConfig::default()
    };
    config.validate()?;
    Ok(config.ice_servers)
}

pub fn new_participant_id() -> String {
    random_id()
}
