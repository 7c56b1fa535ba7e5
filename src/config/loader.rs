use super::schema::{AgentConfig, ServerConfig};
use crate::error::{ConfigError, Result};
use figment::{providers::Env, Figment};

pub fn load_server_config() -> Result<ServerConfig> {
    let config: ServerConfig = Figment::new()
        .merge(Env::prefixed("").only(&[
            "mode",
            "listen",
            "db_conn",
            "encrypt_secret_key",
            "signature_secret_key",
        ]))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate_server(&config)?;

    Ok(config)
}

pub fn load_agent_config() -> Result<AgentConfig> {
    let config: AgentConfig = Figment::new()
        .merge(Env::prefixed("").only(&[
            "mode",
            "server_endpoint",
            "instance_id",
            "instance_token",
            "heartbeat_interval",
            "caddy_endpoint",
        ]))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate_agent(&config)?;

    Ok(config)
}

pub fn validate_server(config: &ServerConfig) -> Result<()> {
    if config.db_conn.is_empty() {
        return Err(ConfigError::MissingField("DB_CONN".into()).into());
    }

    // AES-256-GCM takes exactly a 32-byte key
    if config.encrypt_secret_key.len() != 32 {
        return Err(
            ConfigError::Validation("ENCRYPT_SECRET_KEY must be exactly 32 bytes".into()).into(),
        );
    }

    if config.signature_secret_key.is_empty() {
        return Err(ConfigError::MissingField("SIGNATURE_SECRET_KEY".into()).into());
    }

    Ok(())
}

pub fn validate_agent(config: &AgentConfig) -> Result<()> {
    if !config.server_endpoint.starts_with("http://") && !config.server_endpoint.starts_with("https://")
    {
        return Err(ConfigError::Validation(
            "SERVER_ENDPOINT must be an http(s) URL".into(),
        )
        .into());
    }

    if !config.caddy_endpoint.starts_with("http://") && !config.caddy_endpoint.starts_with("https://")
    {
        return Err(
            ConfigError::Validation("CADDY_ENDPOINT must be an http(s) URL".into()).into(),
        );
    }

    if config.heartbeat_interval == 0 {
        return Err(
            ConfigError::Validation("HEARTBEAT_INTERVAL must be greater than 0".into()).into(),
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::AgentConfig;

    fn agent_config() -> AgentConfig {
        AgentConfig {
            mode: String::new(),
            server_endpoint: "http://coordinator.internal:1323".into(),
            instance_id: 1,
            instance_token: "b7f0f4a0-8e35-4b42-9c77-2b9a4fb9d8f1".into(),
            heartbeat_interval: 60,
            caddy_endpoint: "http://127.0.0.1:2019".into(),
        }
    }

    #[test]
    fn test_agent_validation() {
        assert!(validate_agent(&agent_config()).is_ok());

        let mut bad = agent_config();
        bad.server_endpoint = "coordinator.internal".into();
        assert!(validate_agent(&bad).is_err());

        let mut bad = agent_config();
        bad.heartbeat_interval = 0;
        assert!(validate_agent(&bad).is_err());
    }

    #[test]
    fn test_server_key_length() {
        let config = ServerConfig {
            mode: "dev".into(),
            listen: "0.0.0.0:1323".into(),
            db_conn: ":memory:".into(),
            encrypt_secret_key: "0123456789abcdef0123456789abcdef".into(),
            signature_secret_key: "signing-key".into(),
        };
        assert!(validate_server(&config).is_ok());

        let short = ServerConfig {
            encrypt_secret_key: "too-short".into(),
            ..config
        };
        assert!(validate_server(&short).is_err());
    }
}
