use anyhow::{Context, anyhow};
use kuchiki::Selectors;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SLOT_SELECTOR: &str = ".ad-container";
pub const DEFAULT_API_BASE_URL: &str = "https://api.hotlabel.ai/v1";
pub const DEFAULT_TARGET_SELECTOR: &str = "[data-hotlabel-target]";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("publisher_id is required")]
    MissingPublisherId,
    #[error("replacement_rate must be within 0.0..=1.0, got {0}")]
    ReplacementRate(f64),
    #[error("invalid selector `{0}`")]
    Selector(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

/// Where rendered views go inside a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderMode {
    /// Clear the slot's own children and render into it.
    #[default]
    ReplaceContent,
    /// Render into the first descendant matching `target_selector`, leaving
    /// the rest of the slot alone. Falls back to `ReplaceContent` when the
    /// slot has no such descendant.
    NestedTarget,
}

/// Widget configuration. Fixed once `Widget::init` accepts it.
///
/// Unknown keys are rejected when deserializing so typos in a config file
/// surface instead of silently falling back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WidgetConfig {
    pub publisher_id: String,
    pub slot_selector: String,
    pub api_base_url: Url,
    pub replacement_rate: f64,
    pub theme: Theme,
    pub debug: bool,
    pub render_mode: RenderMode,
    pub target_selector: String,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            publisher_id: String::new(),
            slot_selector: DEFAULT_SLOT_SELECTOR.to_string(),
            api_base_url: Url::parse(DEFAULT_API_BASE_URL).expect("default api url is valid"),
            replacement_rate: 1.0,
            theme: Theme::Light,
            debug: false,
            render_mode: RenderMode::ReplaceContent,
            target_selector: DEFAULT_TARGET_SELECTOR.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl WidgetConfig {
    pub fn new(publisher_id: impl Into<String>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher_id.trim().is_empty() {
            return Err(ConfigError::MissingPublisherId);
        }
        if !(0.0..=1.0).contains(&self.replacement_rate) {
            return Err(ConfigError::ReplacementRate(self.replacement_rate));
        }
        for selector in [&self.slot_selector, &self.target_selector] {
            Selectors::compile(selector).map_err(|()| ConfigError::Selector(selector.clone()))?;
        }
        Ok(())
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading widget config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing widget config {}", path.display()))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Applies `HOTLABEL_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> anyhow::Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        if let Some(publisher_id) = var("HOTLABEL_PUBLISHER_ID") {
            self.publisher_id = publisher_id;
        }
        if let Some(selector) = var("HOTLABEL_SLOT_SELECTOR") {
            self.slot_selector = selector;
        }
        if let Some(url) = var("HOTLABEL_API_URL") {
            self.api_base_url = url.parse().context("failed to parse HOTLABEL_API_URL")?;
        }
        if let Some(rate) = var("HOTLABEL_REPLACEMENT_RATE") {
            self.replacement_rate = rate
                .parse()
                .context("failed to parse HOTLABEL_REPLACEMENT_RATE")?;
        }
        if let Some(theme) = var("HOTLABEL_THEME") {
            self.theme = match theme.to_ascii_lowercase().as_str() {
                "light" => Theme::Light,
                "dark" => Theme::Dark,
                other => return Err(anyhow!("unknown HOTLABEL_THEME `{other}`")),
            };
        }
        if let Some(debug) = var("HOTLABEL_DEBUG") {
            self.debug = debug == "1" || debug.eq_ignore_ascii_case("true");
        }
        if let Some(mode) = var("HOTLABEL_RENDER_MODE") {
            self.render_mode = match mode.to_ascii_lowercase().as_str() {
                "replace-content" => RenderMode::ReplaceContent,
                "nested-target" => RenderMode::NestedTarget,
                other => return Err(anyhow!("unknown HOTLABEL_RENDER_MODE `{other}`")),
            };
        }
        if let Some(selector) = var("HOTLABEL_TARGET_SELECTOR") {
            self.target_selector = selector;
        }
        if let Some(timeout) = var("HOTLABEL_REQUEST_TIMEOUT_MS") {
            let millis: u64 = timeout
                .parse()
                .context("failed to parse HOTLABEL_REQUEST_TIMEOUT_MS")?;
            self.request_timeout = Duration::from_millis(millis);
        }
        Ok(self)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
