//! Hardware Spec Catalogue client (§3, §6.1): a read-only, cached view
//! fetched from the Admin collaborator. The core never hard-codes
//! prices or tiers — only the resolved resource fields.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::{AnyError, CoreError};
use crate::types::HardwareSpec;

const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

struct Cached {
    specs: Vec<HardwareSpec>,
    fetched_at: Instant,
}

#[derive(Clone)]
pub struct HardwareSpecCatalogue {
    http: reqwest::Client,
    base_url: String,
    service_token: String,
    cache: Arc<RwLock<Option<Cached>>>,
}

impl HardwareSpecCatalogue {
    pub fn new(base_url: String, service_token: String) -> Self {
        HardwareSpecCatalogue {
            http: reqwest::Client::new(),
            base_url,
            service_token,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Fetch and cache. Called once at startup, then again opportunistically
    /// whenever `resolve` finds the cache past `REFRESH_INTERVAL`.
    pub async fn refresh(&self) -> Result<(), AnyError> {
        let specs: Vec<HardwareSpec> = self
            .http
            .get(format!("{}/internal/hardware-specs", self.base_url))
            .bearer_auth(&self.service_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut cache = self.cache.write().await;
        *cache = Some(Cached {
            specs,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    async fn ensure_fresh(&self) {
        let needs_refresh = {
            let cache = self.cache.read().await;
            match cache.as_ref() {
                None => true,
                Some(c) => c.fetched_at.elapsed() > REFRESH_INTERVAL,
            }
        };
        if needs_refresh {
            if let Err(err) = self.refresh().await {
                tracing::warn!(error = %err, "hardware spec catalogue refresh failed, using stale cache");
            }
        }
    }

    pub async fn resolve(&self, tier: &str) -> Result<HardwareSpec, CoreError> {
        self.ensure_fresh().await;
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.specs.iter().find(|s| s.tier == tier))
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                kind: "hardware tier",
                id: tier.to_string(),
            })
    }
}
