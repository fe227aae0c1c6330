//! Phoneme-aware text preparation for speech synthesis.
//!
//! A phoneme table is an ordered list of rules fetched as JSON from the
//! organisation's template URLs. `sub` rules replace the matched word with a
//! vendor `<sub>` alias, `phoneme` rules wrap it in IPA markup. Rules are
//! applied in table order, left-to-right, and never inside markup emitted by
//! an earlier rule.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::org::AzureTtsConfig;
use crate::template_cache::TemplateCache;

/// Characters the synthesizer rejects; stripped before substitution so the
/// only markup left in a fragment is markup this module emitted.
pub const DEFAULT_ILLEGAL_CHARS: &[char] = &['<', '>', '"', '\''];

/// One lexicon entry as served by the phoneme template URLs.
#[derive(Debug, Clone, Deserialize)]
pub struct PhonemeRule {
    pub name: String,
    #[serde(default)]
    pub phoneme: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

impl PhonemeRule {
    fn is_usable(&self) -> bool {
        !self.name.is_empty() && (self.phoneme.is_some() || self.sub.is_some())
    }
}

struct CompiledRule {
    pattern: Regex,
    replacement: String,
}

/// A compiled, ready-to-apply phoneme table. Application is pure and
/// deterministic.
pub struct PhonemeTable {
    rules: Vec<CompiledRule>,
}

impl PhonemeTable {
    pub fn compile(rules: &[PhonemeRule]) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules.iter().filter(|r| r.is_usable()) {
            let replacement = match (&rule.sub, &rule.phoneme) {
                (Some(sub), _) => format!("<sub alias=\"{}\">{}</sub>", sub, rule.name),
                (None, Some(ipa)) => format!(
                    "<phoneme alphabet=\"ipa\" ph=\"{}\">{}</phoneme>",
                    ipa, rule.name
                ),
                (None, None) => continue,
            };
            // First alternative matches regions already tagged by an earlier
            // rule so the replacement closure can leave them untouched.
            let source = format!(
                r"(?is)(<(?:phoneme|sub)\b[^>]*>.*?</(?:phoneme|sub)>)|(\b{}\b)",
                regex::escape(&rule.name)
            );
            match Regex::new(&source) {
                Ok(pattern) => compiled.push(CompiledRule {
                    pattern,
                    replacement,
                }),
                Err(err) => warn!(name = %rule.name, error = %err, "Skipping unpatternable phoneme rule"),
            }
        }
        Self { rules: compiled }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule to `text`, left-to-right and non-overlapping.
    pub fn apply(&self, text: &str) -> String {
        let mut current = text.to_string();
        for rule in &self.rules {
            current = rule
                .pattern
                .replace_all(&current, |caps: &regex::Captures<'_>| {
                    if caps.get(1).is_some() {
                        caps[0].to_string()
                    } else {
                        rule.replacement.clone()
                    }
                })
                .into_owned();
        }
        current
    }
}

/// Strip bracketed asides and illegal characters from a fragment before
/// phoneme substitution. Ampersands become the spoken word.
pub fn sanitize_fragment(text: &str, illegal: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for ch in text.chars() {
        match ch {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            '&' => out.push_str(" and "),
            c if illegal.contains(&c) => {}
            c => out.push(c),
        }
    }
    out
}

/// Sanitize then apply a phoneme table. Pure function over its inputs.
pub fn transform_fragment(text: &str, table: &PhonemeTable, illegal: &[char]) -> String {
    let sanitized = sanitize_fragment(text, illegal);
    if table.is_empty() {
        sanitized
    } else {
        table.apply(&sanitized)
    }
}

type LanguageTables = HashMap<String, Arc<PhonemeTable>>;

/// Process-wide cache of compiled phoneme tables, keyed by a digest of the
/// contributing template URLs. Loading the same configuration twice
/// concurrently performs the work once.
pub struct PhonemeLibrary {
    templates: Arc<TemplateCache>,
    compiled: RwLock<HashMap<String, Arc<LanguageTables>>>,
    loading: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PhonemeLibrary {
    pub const DEFAULT_LANGUAGE_KEY: &'static str = "default";

    pub fn new(templates: Arc<TemplateCache>) -> Self {
        Self {
            templates,
            compiled: RwLock::new(HashMap::new()),
            loading: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Table for a language under the given TTS configuration, falling back
    /// to the global-rules table.
    pub async fn table_for(&self, azure: &AzureTtsConfig, language: &str) -> Arc<PhonemeTable> {
        let tables = self.tables_for(azure).await;
        tables
            .get(&language.to_ascii_lowercase())
            .or_else(|| tables.get(Self::DEFAULT_LANGUAGE_KEY))
            .cloned()
            .unwrap_or_else(|| Arc::new(PhonemeTable::empty()))
    }

    async fn tables_for(&self, azure: &AzureTtsConfig) -> Arc<LanguageTables> {
        let cache_id = configuration_digest(azure);
        if let Some(tables) = self.compiled.read().get(&cache_id) {
            return tables.clone();
        }

        let gate = {
            let mut loading = self.loading.lock().await;
            loading
                .entry(cache_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;
        if let Some(tables) = self.compiled.read().get(&cache_id) {
            return tables.clone();
        }

        let tables = Arc::new(self.load_and_compile(azure).await);
        self.compiled.write().insert(cache_id, tables.clone());
        tables
    }

    async fn load_and_compile(&self, azure: &AzureTtsConfig) -> LanguageTables {
        let global = match &azure.phoneme_url {
            Some(url) => self.load_rules(url).await,
            None => Vec::new(),
        };
        if !global.is_empty() {
            info!(count = global.len(), "Loaded global phoneme rules");
        }

        let mut localized: HashMap<String, Vec<PhonemeRule>> = HashMap::new();
        for model in &azure.models {
            if let Some(url) = &model.phoneme_url {
                let rules = self.load_rules(url).await;
                if !rules.is_empty() {
                    info!(language = %model.language, count = rules.len(), "Loaded phoneme rules");
                    localized.insert(model.language.to_ascii_lowercase(), rules);
                }
            }
        }

        let mut tables = LanguageTables::new();
        tables.insert(
            Self::DEFAULT_LANGUAGE_KEY.to_string(),
            Arc::new(PhonemeTable::compile(&order_rules(global.clone(), &[]))),
        );
        for (language, rules) in &localized {
            let merged = order_rules(global.clone(), rules);
            tables.insert(language.clone(), Arc::new(PhonemeTable::compile(&merged)));
        }
        tables
    }

    async fn load_rules(&self, url: &str) -> Vec<PhonemeRule> {
        match self.templates.fetch(url).await {
            Ok(body) => match serde_json::from_slice::<Vec<PhonemeRule>>(&body) {
                Ok(rules) => rules.into_iter().filter(PhonemeRule::is_usable).collect(),
                Err(err) => {
                    warn!(url, error = %err, "Malformed phoneme table");
                    Vec::new()
                }
            },
            Err(err) => {
                warn!(url, error = %err, "Failed to load phoneme table");
                Vec::new()
            }
        }
    }
}

/// Merge global and localized rules (localized wins on a shared name) and
/// order longest name first so compound entries beat their own prefixes.
fn order_rules(global: Vec<PhonemeRule>, localized: &[PhonemeRule]) -> Vec<PhonemeRule> {
    let mut by_name: HashMap<String, PhonemeRule> = HashMap::new();
    for rule in global {
        by_name.insert(rule.name.clone(), rule);
    }
    for rule in localized {
        by_name.insert(rule.name.clone(), rule.clone());
    }
    let mut merged: Vec<PhonemeRule> = by_name.into_values().collect();
    merged.sort_by(|a, b| b.name.len().cmp(&a.name.len()).then(a.name.cmp(&b.name)));
    debug!(count = merged.len(), "Compiled phoneme rule ordering");
    merged
}

fn configuration_digest(azure: &AzureTtsConfig) -> String {
    let mut sources: Vec<String> = Vec::new();
    if let Some(url) = &azure.phoneme_url {
        sources.push(format!("global:{url}"));
    }
    for model in &azure.models {
        if let Some(url) = &model.phoneme_url {
            sources.push(format!("model:{}:{}", model.language, url));
        }
    }
    sources.sort();
    let mut hasher = Sha256::new();
    hasher.update(sources.join("|"));
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
