//! Usage: Free-model discovery across sources (catalog fetch, TTL cache, flat + grouped listings).

#[cfg(test)]
mod tests;

use moka::future::Cache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use crate::shared::time::now_unix_millis;

/// Where a free model was discovered. Declaration order is the flat-listing
/// priority: local Ollama first, then OpenCode Zen, then OpenRouter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Ollama,
    OpenCodeZen,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenCodeZen => "open_code_zen",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Sort rank for provider options inside a grouped model: Zen first,
    /// then OpenRouter, then Ollama.
    fn provider_rank(self) -> u8 {
        match self {
            Self::OpenCodeZen => 0,
            Self::OpenRouter => 1,
            Self::Ollama => 2,
        }
    }

    pub const ALL: [Source; 3] = [Source::Ollama, Source::OpenCodeZen, Source::OpenRouter];
}

/// A free model admitted into the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub source: Source,
    pub capabilities: Vec<String>,
    pub is_free: bool,
    pub discovered_at_unix_ms: i64,
}

/// One provider option inside a grouped model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderOption {
    pub id: String,
    pub source: Source,
    pub is_free: bool,
}

/// Models sharing a canonical display name across sources.
#[derive(Debug, Clone, Serialize)]
pub struct GroupedModel {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub providers: Vec<ProviderOption>,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub ttl: Duration,
    pub ollama_url: String,
    pub openrouter_models_url: String,
    /// Beta-free allow-list; Zen has no machine-readable pricing endpoint.
    pub zen_free_models: Vec<String>,
}

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OPENROUTER_MODELS_URL: &str = "https://openrouter.ai/api/v1/models";

pub fn default_zen_free_models() -> Vec<String> {
    [
        "opencode/grok-code",
        "opencode/glm-4-7-free",
        "opencode/minimax-m-2-1-free",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            openrouter_models_url: DEFAULT_OPENROUTER_MODELS_URL.to_string(),
            zen_free_models: default_zen_free_models(),
        }
    }
}

/// Discovers and caches free models per source.
///
/// A failed refresh keeps serving the previous successful fetch; it never
/// empties the catalog.
#[derive(Clone)]
pub struct FreeModelScanner {
    client: reqwest::Client,
    config: ScannerConfig,
    cache: Cache<Source, Arc<Vec<ModelDescriptor>>>,
    last_good: Arc<RwLock<HashMap<Source, Arc<Vec<ModelDescriptor>>>>>,
}

impl FreeModelScanner {
    pub fn new(client: reqwest::Client, config: ScannerConfig) -> Self {
        let cache = Cache::builder().time_to_live(config.ttl).build();
        Self {
            client,
            config,
            cache,
            last_good: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Flat listing across all sources, ordered by (source priority,
    /// display name). Only free models are ever admitted.
    pub async fn list(&self, force_refresh: bool) -> Vec<ModelDescriptor> {
        let mut all = Vec::new();
        for source in Source::ALL {
            all.extend(self.list_source(source, force_refresh).await.iter().cloned());
        }
        all.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        all
    }

    /// Grouped listing: entries sharing a canonical display name collapse
    /// into one model with multiple provider options.
    pub async fn list_grouped(&self, force_refresh: bool) -> Vec<GroupedModel> {
        let flat = self.list(force_refresh).await;

        let mut grouped: HashMap<String, GroupedModel> = HashMap::new();
        for model in flat {
            let entry = grouped
                .entry(model.display_name.clone())
                .or_insert_with(|| GroupedModel {
                    id: slugify(&model.display_name),
                    name: model.display_name.clone(),
                    capabilities: Vec::new(),
                    providers: Vec::new(),
                });
            for cap in &model.capabilities {
                if !entry.capabilities.contains(cap) {
                    entry.capabilities.push(cap.clone());
                }
            }
            entry.providers.push(ProviderOption {
                id: model.id,
                source: model.source,
                is_free: model.is_free,
            });
        }

        let mut models: Vec<GroupedModel> = grouped.into_values().collect();
        for model in &mut models {
            model
                .providers
                .sort_by_key(|p| (p.source.provider_rank(), p.id.clone()));
        }
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    async fn list_source(&self, source: Source, force_refresh: bool) -> Arc<Vec<ModelDescriptor>> {
        if !force_refresh {
            if let Some(cached) = self.cache.get(&source).await {
                return cached;
            }
        }

        match self.fetch_source(source).await {
            Ok(models) => {
                let models = Arc::new(models);
                self.cache.insert(source, models.clone()).await;
                self.last_good
                    .write()
                    .expect("scanner last_good lock")
                    .insert(source, models.clone());
                models
            }
            Err(err) => {
                tracing::warn!(source = source.as_str(), error = %err, "catalog fetch failed; serving previous snapshot");
                self.last_good
                    .read()
                    .expect("scanner last_good lock")
                    .get(&source)
                    .cloned()
                    .unwrap_or_default()
            }
        }
    }

    async fn fetch_source(&self, source: Source) -> Result<Vec<ModelDescriptor>, reqwest::Error> {
        match source {
            Source::Ollama => self.fetch_ollama().await,
            Source::OpenCodeZen => Ok(self.enumerate_zen()),
            Source::OpenRouter => self.fetch_openrouter().await,
        }
    }

    /// Every locally hosted model is free by definition.
    async fn fetch_ollama(&self) -> Result<Vec<ModelDescriptor>, reqwest::Error> {
        let tags_url = format!("{}/api/tags", self.config.ollama_url);
        let response = self.client.get(&tags_url).send().await?;
        if !response.status().is_success() {
            return Err(response.error_for_status().unwrap_err());
        }

        let data: Value = response.json().await?;
        let now = now_unix_millis();
        let models = data["models"].as_array().cloned().unwrap_or_default();

        Ok(models
            .iter()
            .filter_map(|model| {
                let name = model["name"].as_str()?;
                Some(ModelDescriptor {
                    id: name.to_string(),
                    display_name: normalize_model_name(name),
                    source: Source::Ollama,
                    capabilities: vec!["chat".to_string()],
                    is_free: true,
                    discovered_at_unix_ms: now,
                })
            })
            .collect())
    }

    /// The Zen allow-list is configuration; no credential is needed to
    /// list, only to call.
    fn enumerate_zen(&self) -> Vec<ModelDescriptor> {
        let now = now_unix_millis();
        self.config
            .zen_free_models
            .iter()
            .map(|id| ModelDescriptor {
                id: id.clone(),
                display_name: normalize_model_name(id),
                source: Source::OpenCodeZen,
                capabilities: vec!["chat".to_string()],
                is_free: true,
                discovered_at_unix_ms: now,
            })
            .collect()
    }

    async fn fetch_openrouter(&self) -> Result<Vec<ModelDescriptor>, reqwest::Error> {
        let response = self
            .client
            .get(&self.config.openrouter_models_url)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(response.error_for_status().unwrap_err());
        }

        let data: Value = response.json().await?;
        let models = data["data"].as_array().cloned().unwrap_or_default();
        Ok(filter_openrouter_free(&models))
    }
}

/// A model is free iff both prompt and completion pricing are zero.
/// Missing or unparseable pricing is treated as paid.
pub fn filter_openrouter_free(models: &[Value]) -> Vec<ModelDescriptor> {
    let now = now_unix_millis();
    models
        .iter()
        .filter_map(|model| {
            let id = model["id"].as_str()?;
            let pricing = &model["pricing"];
            let prompt = price_field(&pricing["prompt"]);
            let completion = price_field(&pricing["completion"]);
            if prompt != 0.0 || completion != 0.0 {
                return None;
            }

            let mut capabilities = vec!["chat".to_string()];
            let modality = model["architecture"]["modality"].as_str().unwrap_or("");
            if modality.contains("image") {
                capabilities.push("vision".to_string());
            }

            Some(ModelDescriptor {
                id: id.to_string(),
                display_name: normalize_model_name(id),
                source: Source::OpenRouter,
                capabilities,
                is_free: true,
                discovered_at_unix_ms: now,
            })
        })
        .collect()
}

fn price_field(value: &Value) -> f64 {
    match value {
        Value::String(s) => s.parse::<f64>().unwrap_or(1.0),
        Value::Number(n) => n.as_f64().unwrap_or(1.0),
        _ => 1.0,
    }
}

/// Canonical display name: `"glm-4-7-free"` -> `"GLM 4.7"`,
/// `"grok-code-fast-1"` -> `"Grok Code Fast 1"`.
pub fn normalize_model_name(id: &str) -> String {
    static VERSION_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+)((?:\s+\d+)+)").unwrap());
    static ACRONYMS: &[&str] = &["glm", "gpt", "llm", "ai", "ml"];

    let name = id
        .rsplit('/')
        .next()
        .unwrap_or(id)
        .trim_end_matches(":free")
        .replace("-free", "");

    let spaced = name
        .split(['-', ':'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part.chars().all(|c| c.is_ascii_digit()) {
                part.to_string()
            } else if ACRONYMS.contains(&part.to_lowercase().as_str()) {
                part.to_uppercase()
            } else {
                let mut chars = part.chars();
                match chars.next() {
                    None => String::new(),
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    // "4 7" -> "4.7"
    VERSION_REGEX
        .replace_all(&spaced, |caps: &regex::Captures| {
            format!("{}{}", &caps[1], caps[2].replace(' ', "."))
        })
        .to_string()
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Periodically re-warms the catalog so listings stay within TTL even when
/// the gateway is idle.
pub fn spawn_refresher(scanner: FreeModelScanner) -> tokio::task::JoinHandle<()> {
    let ttl = scanner.config.ttl;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ttl);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately and warms the catalog at startup.
        loop {
            interval.tick().await;
            let count = scanner.list(true).await.len();
            tracing::debug!(models = count, "catalog refreshed");
        }
    })
}
