use crate::document::{HostDocument, attr};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

const MAX_TOPICS: usize = 3;

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z][a-z0-9]+").expect("static word pattern"));

/// Keyword to topic table used to tag the page for targeting.
const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    ("technology", &["tech", "software", "ai", "computer", "gadget", "code", "programming"]),
    ("sports", &["sport", "sports", "football", "soccer", "basketball", "tennis", "match"]),
    ("news", &["news", "breaking", "politics", "election", "world"]),
    ("finance", &["finance", "stock", "stocks", "market", "crypto", "bank", "investing"]),
    ("travel", &["travel", "flight", "hotel", "vacation", "trip"]),
    ("food", &["food", "recipe", "recipes", "restaurant", "cooking"]),
    ("entertainment", &["movie", "movies", "music", "celebrity", "tv", "games"]),
    ("health", &["health", "fitness", "diet", "medical", "wellness"]),
];

/// What the host knows about the browsing environment. Stands in for
/// `navigator` and the scroll position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvironment {
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
    pub viewport_width: u32,
    /// Fraction of the page scrolled, 0.0 to 1.0.
    pub scroll_depth: f64,
}

impl Default for ClientEnvironment {
    fn default() -> Self {
        Self {
            user_agent: format!("hotlabel-widget/{}", env!("CARGO_PKG_VERSION")),
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
            viewport_width: 1280,
            scroll_depth: 0.0,
        }
    }
}

impl ClientEnvironment {
    /// Defaults with `LANG` and `TZ` taken from the process environment.
    pub fn from_env() -> Self {
        let mut env = Self::default();
        if let Some(locale) = std::env::var("LANG")
            .ok()
            .and_then(|lang| lang.split('.').next().map(|l| l.replace('_', "-")))
            .filter(|l| !l.is_empty() && l != "C" && l != "POSIX")
        {
            env.locale = locale;
        }
        if let Ok(tz) = std::env::var("TZ")
            && !tz.is_empty()
        {
            env.timezone = tz;
        }
        env
    }

    pub fn language(&self) -> String {
        self.locale
            .split(['-', '_'])
            .next()
            .filter(|l| !l.is_empty())
            .unwrap_or("en")
            .to_ascii_lowercase()
    }

    pub fn device_class(&self) -> DeviceClass {
        let ua = self.user_agent.to_ascii_lowercase();
        if ua.contains("ipad") || ua.contains("tablet") {
            DeviceClass::Tablet
        } else if ua.contains("mobi") || ua.contains("iphone") || ua.contains("android") {
            DeviceClass::Mobile
        } else if self.viewport_width > 0 && self.viewport_width < 768 {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        }
    }

    pub fn browser_family(&self) -> BrowserFamily {
        let ua = self.user_agent.to_ascii_lowercase();
        // Edge and Chrome both claim Safari, so order matters.
        if ua.contains("edg/") || ua.contains("edge") {
            BrowserFamily::Edge
        } else if ua.contains("firefox") {
            BrowserFamily::Firefox
        } else if ua.contains("chrome") || ua.contains("crios") {
            BrowserFamily::Chrome
        } else if ua.contains("safari") {
            BrowserFamily::Safari
        } else {
            BrowserFamily::Other
        }
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            browser: self.browser_family(),
            device: self.device_class(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Tablet,
    Mobile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chrome,
    Firefox,
    Safari,
    Edge,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub browser: BrowserFamily,
    pub device: DeviceClass,
}

/// Coarse, non-identifying context sent with every task request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowsingProfile {
    pub language: String,
    pub device_type: DeviceClass,
    pub timezone: String,
    pub topics: Vec<String>,
    /// Scroll depth rounded down to a quartile: 0, 25, 50, 75 or 100.
    pub scroll_depth: u8,
}

impl BrowsingProfile {
    pub fn collect(document: &HostDocument, env: &ClientEnvironment) -> Self {
        Self {
            language: env.language(),
            device_type: env.device_class(),
            timezone: env.timezone.clone(),
            topics: page_topics(document),
            scroll_depth: scroll_quartile(env.scroll_depth),
        }
    }
}

fn scroll_quartile(depth: f64) -> u8 {
    let clamped = if depth.is_finite() { depth.clamp(0.0, 1.0) } else { 0.0 };
    ((clamped * 4.0).floor() as u8) * 25
}

/// Topics inferred from the title, meta keywords and headings, ranked by
/// number of keyword hits.
fn page_topics(document: &HostDocument) -> Vec<String> {
    let mut corpus = String::new();
    for selector in ["title", "h1", "h2"] {
        if let Ok(nodes) = document.select_all(selector) {
            for node in nodes {
                corpus.push_str(&node.text_contents());
                corpus.push(' ');
            }
        }
    }
    if let Ok(metas) = document.select_all("meta[name=keywords]") {
        for meta in metas {
            if let Some(content) = attr(&meta, "content") {
                corpus.push_str(&content);
                corpus.push(' ');
            }
        }
    }

    let corpus = corpus.to_ascii_lowercase();
    let words: BTreeSet<&str> = WORD.find_iter(&corpus).map(|m| m.as_str()).collect();
    let mut scored: Vec<(usize, &str)> = TOPIC_KEYWORDS
        .iter()
        .map(|(topic, keywords)| {
            let hits = keywords.iter().filter(|k| words.contains(*k)).count();
            (hits, *topic)
        })
        .filter(|(hits, _)| *hits > 0)
        .collect();
    // Stable sort keeps table order between equally scored topics.
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(MAX_TOPICS)
        .map(|(_, topic)| topic.to_string())
        .collect()
}
