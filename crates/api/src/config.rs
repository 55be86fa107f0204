//! Server configuration from environment variables

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Process configuration
///
/// Provider keys are optional; a provider without a key is left out of the
/// registry and its models fail at submission.
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Externally reachable origin used to build provider callback URLs
    pub public_base_url: String,
    pub webhook_secret: String,
    pub model_catalog_path: String,
    pub cors_allowed_origins: Vec<String>,
    pub fal_api_key: Option<String>,
    pub kie_api_key: Option<String>,
    pub openai_next_api_key: Option<String>,
    pub openai_next_base_url: Option<String>,
}

const MIN_WEBHOOK_SECRET_LEN: usize = 32;

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env_string(name).ok_or(ConfigError::Missing(name))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let webhook_secret = required("WEBHOOK_SECRET")?;
        if webhook_secret.len() < MIN_WEBHOOK_SECRET_LEN {
            return Err(ConfigError::Invalid {
                name: "WEBHOOK_SECRET",
                reason: format!("must be at least {} bytes", MIN_WEBHOOK_SECRET_LEN),
            });
        }

        let public_base_url = required("PUBLIC_BASE_URL")?;
        if !public_base_url.starts_with("http://") && !public_base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                name: "PUBLIC_BASE_URL",
                reason: "must be an http(s) URL".into(),
            });
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: env_string("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".into()),
            public_base_url,
            webhook_secret,
            model_catalog_path: env_string("MODEL_CATALOG_PATH")
                .unwrap_or_else(|| "config/models.json".into()),
            cors_allowed_origins: env_string("CORS_ALLOWED_ORIGINS")
                .map(|origins| parse_origins(&origins))
                .unwrap_or_default(),
            fal_api_key: env_string("FAL_API_KEY"),
            kie_api_key: env_string("KIE_API_KEY"),
            openai_next_api_key: env_string("OPENAI_NEXT_API_KEY"),
            openai_next_base_url: env_string("OPENAI_NEXT_BASE_URL"),
        })
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/').to_string())
        .filter(|o| !o.is_empty())
        .collect()
}
