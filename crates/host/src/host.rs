//! Process-wide host: owns the shared trust and session, and one script
//! context per live page document.

use callgate_security::{ConsentGate, ConsentPrompt, OriginTrustStore};
use common::{BridgeError, BridgeResult};
use js_engine::{BridgeServices, PageContext};
use std::collections::HashMap;
use std::sync::Arc;
use telephony::{PrivilegedSession, TelephonyEngine};
use url::Url;

use crate::config::HostConfig;

/// The extension host.
pub struct ExtensionHost {
    config: HostConfig,
    engine: Arc<dyn TelephonyEngine>,
    trust: Arc<OriginTrustStore>,
    services: Arc<BridgeServices>,
    /// Live page contexts by document id.
    pages: HashMap<u64, PageContext>,
    next_page_id: u64,
}

impl ExtensionHost {
    /// Build the shared services from `config`.
    pub fn new(
        config: HostConfig,
        prompt: Arc<dyn ConsentPrompt>,
        engine: Arc<dyn TelephonyEngine>,
    ) -> BridgeResult<Self> {
        let trust = Arc::new(
            OriginTrustStore::new(
                config.open_preferences()?,
                config.open_permissions()?,
                config.allow_list_key(),
                config.permission_type.as_str(),
            )
            .with_default_origins(config.default_allowed_origins.clone()),
        );
        let gate = Arc::new(ConsentGate::new(trust.clone(), prompt));
        let session = Arc::new(PrivilegedSession::new(engine.clone()));
        let services = Arc::new(
            BridgeServices::new(gate, session)
                .with_consent_message(config.consent_message.as_str())
                .with_video_size(config.video_width, config.video_height),
        );

        tracing::info!(
            "Extension host ready (engine available: {})",
            engine.is_available()
        );

        Ok(Self {
            config,
            engine,
            trust,
            services,
            pages: HashMap::new(),
            next_page_id: 1,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn trust_store(&self) -> &Arc<OriginTrustStore> {
        &self.trust
    }

    pub fn session(&self) -> &Arc<PrivilegedSession> {
        self.services.session()
    }

    /// A new page document was created. Returns the id of its context, or
    /// `None` when the engine is missing and nothing was injected.
    pub fn on_document_created(&mut self, url: &str) -> BridgeResult<Option<u64>> {
        let url = Url::parse(url)?;

        if !self.engine.is_available() {
            tracing::error!("Telephony engine unavailable; not injecting into {}", url);
            return Ok(None);
        }

        let id = self.next_page_id;
        self.next_page_id += 1;

        let page = PageContext::new(id, url, self.services.clone())?;
        tracing::info!("Injected call API into page {} ({})", id, page.url());
        self.pages.insert(id, page);

        Ok(Some(id))
    }

    /// A page document went away. Tears down its context.
    pub fn on_document_destroyed(&mut self, id: u64) -> bool {
        match self.pages.remove(&id) {
            Some(mut page) => {
                page.teardown();
                tracing::info!("Released call API of page {} ({})", id, page.url());
                true
            }
            None => false,
        }
    }

    pub fn page(&self, id: u64) -> Option<&PageContext> {
        self.pages.get(&id)
    }

    pub fn page_mut(&mut self, id: u64) -> Option<&mut PageContext> {
        self.pages.get_mut(&id)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Evaluate a script in a page and drive its calls to completion.
    pub async fn run_script(&mut self, id: u64, source: &str) -> BridgeResult<()> {
        let page = self
            .pages
            .get_mut(&id)
            .ok_or_else(|| BridgeError::config(format!("no page {}", id)))?;
        page.eval(source)?;
        page.run_until_idle().await
    }

    /// Tear down every page.
    pub fn shutdown(&mut self) {
        for (_, mut page) in self.pages.drain() {
            page.teardown();
        }
        tracing::info!("Extension host shut down");
    }
}
