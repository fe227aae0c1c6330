//! Shared application state: process-wide caches, upstream adapters and the
//! request concurrency limiter.

use std::sync::Arc;

use jawabu_core::audio_cache::{AudioCache, FsObjectStore};
use jawabu_core::flow::FlowDeps;
use jawabu_core::generator::OpenAiCompatibleGenerator;
use jawabu_core::km::HttpKmClient;
use jawabu_core::phoneme::PhonemeLibrary;
use jawabu_core::template_cache::{HttpTemplateFetcher, TemplateCache};
use jawabu_core::validator::HttpValidator;
use jawabu_core::{AppConfig, ConfigStore, DirConfigStore};
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Shared client for upstream provider calls.
    pub http: reqwest::Client,
    pub org_store: Arc<dyn ConfigStore>,
    pub templates: Arc<TemplateCache>,
    pub audio_cache: AudioCache,
    pub phonemes: Arc<PhonemeLibrary>,
    pub deps: FlowDeps,
    /// Concurrency limiter to prevent resource exhaustion.
    pub request_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let max_concurrent = std::env::var("MAX_CONCURRENT_REQUESTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let http = reqwest::Client::builder()
            .user_agent(concat!("jawabu-server/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let templates = Arc::new(TemplateCache::new(Arc::new(HttpTemplateFetcher::new()?)));
        let phonemes = Arc::new(PhonemeLibrary::new(templates.clone()));
        let audio_cache = AudioCache::new(Arc::new(FsObjectStore::new(&config.audio_cache_dir)));
        let org_store: Arc<dyn ConfigStore> = Arc::new(DirConfigStore::new(&config.org_config_dir));

        let deps = FlowDeps {
            validator: Arc::new(HttpValidator::new(
                http.clone(),
                config.validator_api_base_url.clone(),
                config.request_timeout,
            )),
            km: Arc::new(HttpKmClient::new(
                http.clone(),
                config.km_api_url.clone(),
                config.km_token.clone(),
                config.request_timeout,
            )),
            generator: Arc::new(OpenAiCompatibleGenerator::new(
                http.clone(),
                config.openai_api_base_url.clone(),
                config.groq_api_base_url.clone(),
            )),
            templates: templates.clone(),
        };

        Ok(Self {
            config: Arc::new(config),
            http,
            org_store,
            templates,
            audio_cache,
            phonemes,
            deps,
            request_semaphore: Arc::new(Semaphore::new(max_concurrent)),
        })
    }
}
