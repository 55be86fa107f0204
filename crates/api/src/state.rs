//! Application state

use std::sync::Arc;

use aigc_billing::{BillingUserDirectory, PgCreditLedger};
use aigc_tasks::{
    Catalogs, FalAdapter, FalConfig, KieAiAdapter, KieAiConfig, ModelCatalog, OpenAiNextAdapter,
    OpenAiNextConfig, PgTaskStore, ProviderRegistry, TaskOrchestrator, TaskResult, WebhookSigner,
};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub orchestrator: TaskOrchestrator,
    /// Verifies the per-subtask token on provider callbacks
    pub signer: WebhookSigner,
}

impl AppState {
    /// Wire the Postgres-backed stores, the model catalog and the configured providers
    pub fn new(pool: PgPool, config: Config) -> TaskResult<Self> {
        let catalog = Arc::new(ModelCatalog::load(&config.model_catalog_path)?);
        let signer = WebhookSigner::new(
            config.webhook_secret.as_bytes().to_vec(),
            config.public_base_url.clone(),
        );

        let orchestrator = TaskOrchestrator::new(
            Arc::new(PgTaskStore::new(pool.clone())),
            Arc::new(PgCreditLedger::new(pool.clone())),
            provider_registry(&config),
            Catalogs::from_single(catalog),
            Arc::new(BillingUserDirectory::new(pool)),
            signer.clone(),
        );

        Ok(Self::from_parts(config, orchestrator, signer))
    }

    pub fn from_parts(config: Config, orchestrator: TaskOrchestrator, signer: WebhookSigner) -> Self {
        Self {
            config,
            orchestrator,
            signer,
        }
    }
}

/// Register one adapter per provider that has an API key
pub fn provider_registry(config: &Config) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    match &config.fal_api_key {
        Some(key) => registry.register(Arc::new(FalAdapter::new(FalConfig::new(key.clone())))),
        None => tracing::warn!("FAL_API_KEY not set - fal models are unavailable"),
    }

    match &config.kie_api_key {
        Some(key) => registry.register(Arc::new(KieAiAdapter::new(KieAiConfig::new(key.clone())))),
        None => tracing::warn!("KIE_API_KEY not set - kie.ai models are unavailable"),
    }

    match &config.openai_next_api_key {
        Some(key) => {
            let mut next = OpenAiNextConfig::new(key.clone());
            if let Some(base_url) = &config.openai_next_base_url {
                next = next.with_base_url(base_url.clone());
            }
            registry.register(Arc::new(OpenAiNextAdapter::new(next)));
        }
        None => tracing::warn!("OPENAI_NEXT_API_KEY not set - OpenAI-Next models are unavailable"),
    }

    tracing::info!(providers = ?registry.providers(), "Provider registry ready");
    registry
}
