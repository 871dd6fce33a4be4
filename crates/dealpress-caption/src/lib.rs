//! Caption, hashtag and first-comment generation. The skeleton is fixed and
//! deterministic; a generative service may restyle the body or pick the
//! category, and every generative miss falls back to rules.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dealpress_core::{PromoCode, PromoInfo};
use dealpress_storage::HttpFetcher;
use once_cell::sync::Lazy;
use rand::{thread_rng, Rng};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

pub const CRATE_NAME: &str = "dealpress-caption";

/// Affiliate disclosure, always the first caption line.
pub const DISCLOSURE_PREFIX: &str = "(Ad)(#CommissionEarned)";

pub const DEFAULT_PROMO_MESSAGE: &str = "Limited-time deal available!";
pub const EXPIRED_PROMO_MESSAGE: &str = "Price updated — deal may no longer be available.";

pub const CATCHY_OPENERS: [&str; 9] = [
    "Snag It!",
    "Grab It!",
    "Pick It!",
    "Spot It!",
    "DealSnag!",
    "TrendGrab!",
    "QuickGrab!",
    "HotPick!",
    "ClickSnag!",
];

/// Brand tags appended to every hashtag line.
pub const BRAND_TAGS: &str =
    "#deals2spot #dealstospot #stealspotdeals #amazonfinds #AmazonDeals #BlackFriday";

const ALLOWED_CATEGORIES: [&str; 14] = [
    "beauty",
    "electronics",
    "home",
    "kitchen",
    "toys",
    "crafts",
    "fashion",
    "kids",
    "fitness",
    "pets",
    "office",
    "decor",
    "gadgets",
    "other",
];

const CATEGORY_ALIASES: [(&str, &str); 10] = [
    ("kids", "Kids & Toys"),
    ("toys", "Kids & Toys"),
    ("gadgets", "Gadgets"),
    ("electronics", "Electronics"),
    ("decor", "Decor"),
    ("garden", "Garden"),
    ("fitness", "Fitness"),
    ("beauty", "Beauty"),
    ("kitchen", "Kitchen"),
    ("home", "Home"),
];

const APPROVED_COMMENTS: [&str; 4] = [
    "Who's grabbing this first? Comment below! 👇🔥",
    "Tell me if you're getting it! ❤️👇",
    "Let's see who buys this first — comment DONE! 🎉",
    "Would you get this? Comment YES! 👇",
];

const DEFAULT_KEYWORD_RULES: &str = include_str!("../assets/category_keywords.yaml");
const DEFAULT_HASHTAG_TABLE: &str = include_str!("../assets/category_hashtags.yaml");

static HASHTAG_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#\w+").unwrap());

/// Seam for the generative text service. `None` means "no usable answer";
/// callers fall back to their deterministic path.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Option<String>;
}

pub const DEFAULT_GENERATIVE_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_GENERATIVE_BASE: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GenerativeConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f64,
    pub max_output_tokens: u32,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GENERATIVE_BASE.to_string(),
            model: DEFAULT_GENERATIVE_MODEL.to_string(),
            api_key: None,
            temperature: 0.7,
            max_output_tokens: 256,
        }
    }
}

/// `generateContent` REST client. Without an API key every call answers
/// `None` and the deterministic fallbacks take over.
pub struct GeminiClient {
    http: HttpFetcher,
    config: GenerativeConfig,
}

impl GeminiClient {
    pub fn new(http: HttpFetcher, config: GenerativeConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Option<String> {
        let key = self.config.api_key.as_deref()?;
        if key.is_empty() {
            return None;
        }
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            key
        );
        let body = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_output_tokens,
            },
        });
        let reply = match self.http.post_json(&url, &body, &[]).await {
            Ok(value) => value,
            Err(error) => {
                debug!(%error, "generative request failed");
                return None;
            }
        };
        let text = reply
            .pointer("/candidates/0/content/parts/0/text")?
            .as_str()?;
        let text = strip_code_fences(text);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Drop surrounding ``` fences that chat models like to wrap replies in.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines
        .last()
        .map(|line| line.trim().starts_with("```"))
        .unwrap_or(false)
    {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<KeywordRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordRule {
    category: String,
    contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HashtagTableFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    categories: Vec<CategoryTags>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryTags {
    name: String,
    tags: Vec<String>,
}

/// Category keyword rules and per-category hashtag lists, loaded from YAML.
/// Rule order matters: the first keyword rule that matches wins.
#[derive(Debug, Clone)]
pub struct CategoryRules {
    keyword_rules: Vec<KeywordRule>,
    hashtag_table: Vec<CategoryTags>,
}

impl CategoryRules {
    /// The compiled-in default tables.
    pub fn bundled() -> Result<Self> {
        let keywords: KeywordRulesFile =
            serde_yaml::from_str(DEFAULT_KEYWORD_RULES).context("parsing bundled keyword rules")?;
        let table: HashtagTableFile =
            serde_yaml::from_str(DEFAULT_HASHTAG_TABLE).context("parsing bundled hashtag table")?;
        Ok(Self {
            keyword_rules: keywords.rules,
            hashtag_table: table.categories,
        })
    }

    /// Load `category_keywords.yaml` and `category_hashtags.yaml` from a
    /// rules directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let keywords: KeywordRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(dir.join("category_keywords.yaml"))
                .context("reading category_keywords.yaml")?,
        )
        .context("parsing category_keywords.yaml")?;
        let table: HashtagTableFile = serde_yaml::from_str(
            &std::fs::read_to_string(dir.join("category_hashtags.yaml"))
                .context("reading category_hashtags.yaml")?,
        )
        .context("parsing category_hashtags.yaml")?;
        Ok(Self {
            keyword_rules: keywords.rules,
            hashtag_table: table.categories,
        })
    }

    fn heuristic_category(&self, product_name: &str) -> Option<String> {
        let lowered = product_name.to_lowercase();
        for rule in &self.keyword_rules {
            if rule
                .contains_any
                .iter()
                .any(|keyword| lowered.contains(keyword.as_str()))
            {
                return Some(rule.category.clone());
            }
        }
        None
    }

    fn tags_for(&self, key: &str) -> Option<&[String]> {
        self.hashtag_table
            .iter()
            .find(|entry| entry.name == key)
            .map(|entry| entry.tags.as_slice())
    }

    /// Map a detected category to a hashtag-table key: exact name, then the
    /// alias map, then Title-case, then `Other`.
    fn table_key(&self, category: &str) -> String {
        let trimmed = category.trim();
        if self.tags_for(trimmed).is_some() {
            return trimmed.to_string();
        }
        let lowered = trimmed.to_lowercase();
        if let Some((_, target)) = CATEGORY_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lowered)
        {
            if self.tags_for(target).is_some() {
                return (*target).to_string();
            }
        }
        let title = title_case(trimmed);
        if self.tags_for(&title).is_some() {
            return title;
        }
        "Other".to_string()
    }
}

fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct CaptionConfig {
    pub promo_enabled: bool,
    pub promo_default_message: String,
    pub promo_expired_message: String,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            promo_enabled: true,
            promo_default_message: DEFAULT_PROMO_MESSAGE.to_string(),
            promo_expired_message: EXPIRED_PROMO_MESSAGE.to_string(),
        }
    }
}

/// Minimal caption used when full assembly is unavailable: disclosure,
/// name when present, link when present.
pub fn fallback_caption(product_name: &str, link: &str) -> String {
    let mut caption = DISCLOSURE_PREFIX.to_string();
    let name = product_name.trim();
    if !name.is_empty() {
        caption.push('\n');
        caption.push_str(name);
    }
    let link = link.trim();
    if !link.is_empty() {
        caption.push_str("\n\n👉 ");
        caption.push_str(link);
    }
    caption
}

fn code_block(promo_code: Option<&PromoCode>) -> Option<String> {
    let info = promo_code?;
    if !info.has_promo || info.code.is_empty() {
        return None;
    }
    let discount = info.discount.trim();
    let first = if discount.is_empty() {
        format!("💥 Code: {}", info.code)
    } else {
        format!("💥 Code: {} — {}", info.code, discount)
    };
    Some(format!("{first}\n⏳ Code may expire anytime"))
}

fn deterministic_body(product_name: &str) -> String {
    let opener = CATCHY_OPENERS[thread_rng().gen_range(0..CATCHY_OPENERS.len())];
    format!("{opener} {product_name}").trim().to_string()
}

/// Clean a generated body before it may replace the deterministic one: the
/// restated disclosure prefix goes, hashtag tokens go, lines carrying the
/// raw link go, blank lines collapse.
fn sanitize_generated_body(raw: &str, link: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    for line in raw.lines() {
        let mut line = line.trim();
        if let Some(rest) = line.strip_prefix(DISCLOSURE_PREFIX) {
            line = rest.trim();
        }
        if !link.is_empty() && line.contains(link) {
            continue;
        }
        let line = HASHTAG_TOKEN_RE.replace_all(line, "");
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n")
}

fn with_brand(tags: &[String]) -> String {
    let picked = tags
        .iter()
        .take(12)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    if picked.is_empty() {
        BRAND_TAGS.to_string()
    } else {
        format!("{picked} {BRAND_TAGS}")
    }
}

fn approved_comment() -> String {
    APPROVED_COMMENTS[thread_rng().gen_range(0..APPROVED_COMMENTS.len())].to_string()
}

/// Assembles captions, hashtag lines and first comments for one run.
pub struct CaptionEngine {
    config: CaptionConfig,
    rules: CategoryRules,
    generator: Arc<dyn TextGenerator>,
}

impl CaptionEngine {
    pub fn new(
        config: CaptionConfig,
        rules: CategoryRules,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            config,
            rules,
            generator,
        }
    }

    /// Full affiliate caption: disclosure, body, optional promo line and
    /// code block, link line, hashtag line.
    pub async fn caption(
        &self,
        product_name: &str,
        link: &str,
        promo: Option<&PromoInfo>,
        promo_code: Option<&PromoCode>,
    ) -> String {
        let name = product_name.trim();
        let link = link.trim();

        let mut header = vec![DISCLOSURE_PREFIX.to_string(), self.body(name, link).await];
        if let Some(info) = promo {
            let line = self.promo_caption_text(info);
            if !line.is_empty() {
                header.push(line);
            }
        }
        if let Some(block) = code_block(promo_code) {
            header.push(block);
        }

        let mut sections = vec![header.join("\n").trim().to_string()];
        if !link.is_empty() {
            sections.push(format!("👉 {link}"));
        }
        sections.push(self.hashtags(name).await);
        sections.join("\n\n").trim().to_string()
    }

    /// Caption body, with the generative restyle replacing the deterministic
    /// opener + name only when its sanitized form is non-empty.
    async fn body(&self, product_name: &str, link: &str) -> String {
        let base = deterministic_body(product_name);
        let prompt = format!(
            "Rewrite this product deal caption so it is catchy and short, \
             under 12 words, no hashtags, no links: {base}"
        );
        match self.generator.generate(&prompt).await {
            Some(raw) => {
                let cleaned = sanitize_generated_body(&raw, link);
                if cleaned.is_empty() {
                    base
                } else {
                    cleaned
                }
            }
            None => base,
        }
    }

    fn promo_caption_text(&self, promo: &PromoInfo) -> String {
        if !self.config.promo_enabled {
            return String::new();
        }
        if promo.has_promo {
            let text = promo.promo_text.trim();
            if text.is_empty() {
                format!("✨ {} ✨", self.config.promo_default_message)
            } else {
                format!("✨ {text} ✨")
            }
        } else {
            self.config.promo_expired_message.clone()
        }
    }

    async fn detect_category(&self, product_name: &str) -> String {
        let heuristic = self.rules.heuristic_category(product_name);
        let prompt = format!(
            "Classify this product into exactly one of these categories: {}. \
             Reply with the category word only.\n\nProduct: {product_name}",
            ALLOWED_CATEGORIES.join(", ")
        );
        let answer = self
            .generator
            .generate(&prompt)
            .await
            .and_then(|raw| raw.lines().next().map(|line| line.trim().to_lowercase()));
        let Some(answer) = answer else {
            return heuristic.unwrap_or_else(|| "Home".to_string());
        };
        let valid = ALLOWED_CATEGORIES.contains(&answer.as_str());
        if valid && matches!(answer.as_str(), "home" | "other") {
            // Generic answers lose to a concrete keyword hit.
            if let Some(category) = heuristic {
                return category;
            }
        }
        if valid {
            return title_case(&answer);
        }
        heuristic.unwrap_or_else(|| "Home".to_string())
    }

    /// Hashtag line: category table tags plus the brand tags, with a
    /// generative free-form fallback when the table has nothing.
    pub async fn hashtags(&self, product_name: &str) -> String {
        let category = self.detect_category(product_name).await;
        let key = self.rules.table_key(&category);
        if let Some(tags) = self.rules.tags_for(&key) {
            if !tags.is_empty() {
                return with_brand(tags);
            }
        }

        let prompt = format!(
            "Give one line of short marketing hashtags for this product, \
             space separated, each starting with #: {product_name}"
        );
        if let Some(raw) = self.generator.generate(&prompt).await {
            let mut unique: Vec<String> = Vec::new();
            for found in HASHTAG_TOKEN_RE.find_iter(&raw) {
                let tag = found.as_str().to_string();
                if !unique.contains(&tag) {
                    unique.push(tag);
                }
            }
            if !unique.is_empty() {
                return format!("{} {BRAND_TAGS}", unique.join(" "));
            }
        }

        match self.rules.tags_for("Other") {
            Some(tags) => with_brand(tags),
            None => BRAND_TAGS.to_string(),
        }
    }

    /// Short engagement line posted as the first comment.
    pub async fn first_comment(&self, product_name: &str) -> String {
        let prompt = format!(
            "Write one short, friendly first comment for a social post about \
             this product deal, under 15 words: {product_name}"
        );
        match self.generator.generate(&prompt).await {
            Some(text) => text,
            None => approved_comment(),
        }
    }
}
