//! Repurposing gateway: article in, one completion call, one post per requested format out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use common::{LimitsConfig, LlmConfig};

use crate::error::GatewayError;
use crate::formats::Format;
use crate::llm::{extract_json_from_text, LlmProvider, LlmRequest};

/// Output tokens assumed by the cost estimate, independent of `max_tokens`.
const ESTIMATED_OUTPUT_TOKENS: usize = 1500;
/// Fixed prompt overhead (instructions and JSON template) in tokens.
const PROMPT_OVERHEAD_TOKENS: usize = 500;

/// Result of a successful repurpose call
#[derive(Debug, Clone, Serialize)]
pub struct Repurposed {
    pub id: Uuid,
    /// Exactly one non-empty entry per requested format
    pub formats: BTreeMap<Format, String>,
    pub hashtags: Vec<String>,
    pub tokens_used: usize,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub estimated_tokens: usize,
    pub estimated_cost_usd: f64,
}

/// Gateway between callers and the completion API. Holds no per-request state.
pub struct Repurposer {
    provider: Arc<dyn LlmProvider>,
    limits: LimitsConfig,
    max_tokens: usize,
    temperature: f32,
    cost_per_1k_tokens: f64,
}

impl Repurposer {
    pub fn new(provider: Arc<dyn LlmProvider>, limits: LimitsConfig) -> Self {
        let llm = LlmConfig::default();
        Self {
            provider,
            limits,
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            cost_per_1k_tokens: llm.cost_per_1k_tokens,
        }
    }

    pub fn from_config(provider: Arc<dyn LlmProvider>, llm: &LlmConfig, limits: &LimitsConfig) -> Self {
        Self {
            provider,
            limits: limits.clone(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            cost_per_1k_tokens: llm.cost_per_1k_tokens,
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Check article and format set before anything leaves the process.
    pub fn validate(&self, article: &str, formats: &BTreeSet<Format>) -> Result<(), GatewayError> {
        let chars = article.trim().chars().count();
        if chars == 0 {
            return Err(GatewayError::Validation("article must not be empty".to_string()));
        }
        if chars < self.limits.min_article_chars {
            return Err(GatewayError::Validation(format!(
                "article must be at least {} characters long",
                self.limits.min_article_chars
            )));
        }
        if chars > self.limits.max_article_chars {
            return Err(GatewayError::Validation(format!(
                "article must be at most {} characters long",
                self.limits.max_article_chars
            )));
        }
        if formats.is_empty() {
            return Err(GatewayError::Validation(
                "at least one target format is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Produce one post per requested format with a single completion request.
    ///
    /// Either every requested format comes back non-empty or the call fails; callers never
    /// see a partial mapping.
    pub async fn repurpose(
        &self,
        article: &str,
        formats: &BTreeSet<Format>,
        content_type: &str,
    ) -> Result<Repurposed, GatewayError> {
        self.validate(article, formats)?;

        let id = Uuid::new_v4();
        let content_type = match content_type.trim() {
            "" => "article",
            other => other,
        };

        let request = LlmRequest {
            system: Some(build_system_prompt(formats)),
            prompt: build_user_prompt(article.trim(), content_type, formats),
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            timeout_seconds: None,
        };

        info!(%id, formats = formats.len(), chars = article.len(), "repurposing content");

        let response = self.provider.generate(request).await.map_err(|e| {
            warn!(%id, "completion request failed: {:#}", e);
            GatewayError::upstream(e)
        })?;

        let sections = split_sections(&response.content, formats).map_err(|e| {
            warn!(%id, "completion could not be split into formats: {}", e);
            e
        })?;

        info!(
            %id,
            tokens = response.usage.total_tokens,
            model = %response.model,
            "repurpose complete"
        );

        Ok(Repurposed {
            id,
            formats: sections.formats,
            hashtags: sections.hashtags,
            tokens_used: response.usage.total_tokens,
            model: response.model,
        })
    }

    /// Rough token and price estimate for an article.
    pub fn estimate_cost(&self, article: &str) -> CostEstimate {
        let input_tokens = article.chars().count() / 4 + PROMPT_OVERHEAD_TOKENS;
        let estimated_tokens = input_tokens + ESTIMATED_OUTPUT_TOKENS;
        CostEstimate {
            estimated_tokens,
            estimated_cost_usd: estimated_tokens as f64 / 1000.0 * self.cost_per_1k_tokens,
        }
    }
}

pub fn build_system_prompt(formats: &BTreeSet<Format>) -> String {
    let rules: Vec<String> = formats.iter().map(|f| format!("- {}", f.guidance())).collect();
    format!(
        "You are a social media content expert. Your task is to repurpose content into multiple formats.\n\n\
Rules:\n\
- Keep the core message but adapt tone for each platform\n\
{}\n\n\
IMPORTANT: Respond ONLY with valid JSON. No markdown, no code blocks, no explanations.",
        rules.join("\n")
    )
}

pub fn build_user_prompt(article: &str, content_type: &str, formats: &BTreeSet<Format>) -> String {
    let mut fields: Vec<String> = formats
        .iter()
        .map(|f| format!("    \"{}\": {}", f.as_str(), f.json_shape()))
        .collect();
    fields.push(r#"    "hashtags": ["hashtag1", "hashtag2", "hashtag3", "hashtag4", "hashtag5"]"#.to_string());

    format!(
        "Repurpose this {content_type} into social media content:\n\n---\n{article}\n---\n\n\
Respond with this exact JSON structure (no markdown!):\n{{\n{}\n}}",
        fields.join(",\n")
    )
}

/// Per-format sections split out of a completion.
#[derive(Debug, Default)]
pub struct Sections {
    pub formats: BTreeMap<Format, String>,
    pub hashtags: Vec<String>,
}

/// Partition completion text into the requested formats.
///
/// The model is asked for JSON; when it ignores that, header-delimited plain text is
/// accepted instead. Keys that were not requested are dropped.
pub fn split_sections(raw: &str, formats: &BTreeSet<Format>) -> Result<Sections, GatewayError> {
    let parsed = extract_json_from_text(raw)
        .and_then(|json| serde_json::from_str::<Value>(&json).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        });

    let mut sections = match parsed {
        Some(map) => sections_from_json(&map, formats),
        None => sections_from_headers(raw, formats),
    };

    // Fully formed or nothing.
    let missing: Vec<&str> = formats
        .iter()
        .filter(|f| sections.formats.get(*f).map_or(true, |s| s.trim().is_empty()))
        .map(|f| f.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(GatewayError::Upstream(format!(
            "completion did not contain content for: {}",
            missing.join(", ")
        )));
    }

    sections.formats.retain(|f, _| formats.contains(f));
    Ok(sections)
}

fn sections_from_json(map: &serde_json::Map<String, Value>, formats: &BTreeSet<Format>) -> Sections {
    let mut sections = Sections::default();

    for format in formats {
        let value = map
            .get(format.as_str())
            .or_else(|| map.iter().find(|(k, _)| format.matches_key(k)).map(|(_, v)| v));
        if let Some(text) = value.map(render_value).filter(|t| !t.trim().is_empty()) {
            sections.formats.insert(*format, text);
        }
    }

    if let Some(tags) = map.get("hashtags").or_else(|| map.get("key_hashtags")) {
        sections.hashtags = match tags {
            Value::Array(items) => items.iter().map(render_value).filter(|t| !t.is_empty()).collect(),
            Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        };
    }

    sections
}

/// Flatten a JSON value into post text.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Object(obj) => {
            let subject = obj.get("subject").map(render_value).unwrap_or_default();
            let body = obj.get("body").map(render_value).unwrap_or_default();
            if !subject.is_empty() || !body.is_empty() {
                match (subject.is_empty(), body.is_empty()) {
                    (false, false) => format!("Subject: {}\n\n{}", subject, body),
                    (false, true) => format!("Subject: {}", subject),
                    _ => body,
                }
            } else {
                obj.values()
                    .map(render_value)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
        }
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
    }
}

fn sections_from_headers(raw: &str, formats: &BTreeSet<Format>) -> Sections {
    let mut collected: BTreeMap<Format, Vec<&str>> = BTreeMap::new();
    let mut current: Option<Format> = None;

    for line in raw.lines() {
        if let Some((format, rest)) = header_format(line) {
            current = Some(format);
            let entry = collected.entry(format).or_default();
            if !rest.is_empty() {
                entry.push(rest);
            }
            continue;
        }
        if let Some(format) = current {
            collected.entry(format).or_default().push(line);
        }
    }

    let mut sections = Sections::default();
    for (format, lines) in collected {
        if !formats.contains(&format) {
            continue;
        }
        let text = lines.join("\n").trim().to_string();
        if !text.is_empty() {
            sections.formats.insert(format, text);
        }
    }
    sections
}

/// Recognize lines like `## Twitter`, `**LinkedIn:** post...`, `EMAIL:` or a bare `TikTok`.
///
/// Without markdown markup a line only counts when nothing follows the colon, so body text
/// such as `Email: sales@x.com` stays in the section it belongs to.
fn header_format(line: &str) -> Option<(Format, &str)> {
    let trimmed = line.trim();
    let marked = trimmed.starts_with(['#', '*']);
    let stripped = trimmed.trim_start_matches(['#', '*', '-', ' ']);
    let (head, rest) = match stripped.find(':') {
        Some(idx) => (&stripped[..idx], stripped[idx + 1..].trim_start_matches('*').trim()),
        None => (stripped, ""),
    };
    let head = head.trim().trim_end_matches('*').trim();
    if head.is_empty() || head.len() > 24 {
        return None;
    }
    if !marked && !rest.is_empty() {
        return None;
    }
    let head = head.split('/').next().unwrap_or(head).trim();
    let format = head
        .parse::<Format>()
        .ok()
        .or_else(|| head.split_whitespace().next().and_then(|w| w.parse().ok()))?;
    // A bare word line with no colon and no markup must be exactly the name.
    if !marked && !trimmed.contains(':') && !head.eq_ignore_ascii_case(format.as_str()) {
        return None;
    }
    Some((format, rest))
}
