use crate::identity::generate_id;
use crate::profile::ClientInfo;
use rand::Rng;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[serde(alias = "image_classification")]
    Image,
    #[serde(alias = "text_classification")]
    Text,
    #[serde(alias = "visual_question_answering")]
    Vqa,
    #[serde(alias = "true-false", alias = "boolean")]
    TrueFalse,
    /// Categories this widget has no bespoke media for; rendered as prompt
    /// plus options.
    #[serde(other)]
    Other,
}

impl TaskCategory {
    /// Simulated publisher earnings for one answered task.
    pub fn reward(self) -> f64 {
        match self {
            TaskCategory::Image => 0.03,
            TaskCategory::Text => 0.02,
            TaskCategory::Vqa => 0.04,
            TaskCategory::TrueFalse | TaskCategory::Other => 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
}

/// Where a task came from. Fallback tasks are rendered with a demo badge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskOrigin {
    #[default]
    Provider,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub key: String,
    pub label: String,
}

/// Choice key to label, in the order the provider sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Choices(Vec<Choice>);

impl Choices {
    pub fn from_pairs<K, L>(pairs: impl IntoIterator<Item = (K, L)>) -> Self
    where
        K: Into<String>,
        L: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(key, label)| Choice {
                    key: key.into(),
                    label: label.into(),
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &Choice> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|choice| choice.key == key)
            .map(|choice| choice.label.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.label(key).is_some()
    }
}

impl Serialize for Choices {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for choice in &self.0 {
            map.serialize_entry(&choice.key, &choice.label)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Choices {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ChoicesVisitor)
    }
}

struct ChoicesVisitor;

impl<'de> Visitor<'de> for ChoicesVisitor {
    type Value = Choices;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of choice keys to labels, or a list of labels")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Choices, A::Error> {
        let mut choices: Vec<Choice> = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, label)) = map.next_entry::<String, String>()? {
            if choices.iter().any(|existing| existing.key == key) {
                return Err(de::Error::custom(format!("duplicate choice key `{key}`")));
            }
            choices.push(Choice { key, label });
        }
        Ok(Choices(choices))
    }

    // Bare label lists get keys `a`, `b`, `c`, ...
    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Choices, A::Error> {
        let mut choices = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(label) = seq.next_element::<String>()? {
            choices.push(Choice {
                key: positional_key(choices.len()),
                label,
            });
        }
        Ok(Choices(choices))
    }
}

fn positional_key(index: usize) -> String {
    match u8::try_from(index) {
        Ok(i) if i < 26 => char::from(b'a' + i).to_string(),
        _ => index.to_string(),
    }
}

/// A labeling question. Never mutated after creation; answering produces a
/// separate [`TaskResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(alias = "id")]
    pub task_id: String,
    #[serde(default = "default_language", alias = "locale")]
    pub language: String,
    #[serde(alias = "type", alias = "task_type")]
    pub category: TaskCategory,
    #[serde(alias = "question")]
    pub prompt: String,
    #[serde(default, alias = "image")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(alias = "options")]
    pub choices: Choices,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(skip)]
    pub origin: TaskOrigin,
}

fn default_language() -> String {
    "en".to_string()
}

const FALLBACK_VARIANTS: usize = 3;

impl Task {
    /// One of the built-in demo tasks, picked at random.
    pub fn fallback() -> Self {
        Self::fallback_variant(rand::thread_rng().gen_range(0..FALLBACK_VARIANTS))
    }

    pub fn fallback_variant(index: usize) -> Self {
        let (category, prompt, image_url, text, choices) = match index % FALLBACK_VARIANTS {
            0 => (
                TaskCategory::Image,
                "What object is shown in this image?",
                Some("https://picsum.photos/300/200"),
                None,
                Choices::from_pairs([("a", "Cat"), ("b", "Dog"), ("c", "Car"), ("d", "House")]),
            ),
            1 => (
                TaskCategory::Text,
                "What is the sentiment of this text?",
                None,
                Some(
                    "I really enjoyed the service at the restaurant yesterday. \
                     The food was delicious and the staff was very friendly.",
                ),
                Choices::from_pairs([("a", "Positive"), ("b", "Neutral"), ("c", "Negative")]),
            ),
            _ => (
                TaskCategory::Vqa,
                "How many people are in this image?",
                Some("https://picsum.photos/300/200?people"),
                None,
                Choices::from_pairs([("a", "0"), ("b", "1"), ("c", "2"), ("d", "3 or more")]),
            ),
        };
        Self {
            task_id: format!("demo-{}", generate_id()),
            language: default_language(),
            category,
            prompt: prompt.to_string(),
            image_url: image_url.map(str::to_string),
            text: text.map(str::to_string),
            choices,
            status: TaskStatus::Pending,
            origin: TaskOrigin::Fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.origin == TaskOrigin::Fallback
    }

    /// Reason a provider task cannot be shown, if any.
    pub fn defect(&self) -> Option<&'static str> {
        if self.task_id.trim().is_empty() {
            Some("task has no id")
        } else if self.prompt.trim().is_empty() {
            Some("task has an empty prompt")
        } else if self.choices.is_empty() {
            Some("task has no choices")
        } else {
            None
        }
    }
}

/// The user's answer to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub session_id: String,
    pub user_id: String,
    pub publisher_id: String,
    pub category: TaskCategory,
    pub selected_choice: String,
    pub response_time_ms: u64,
    pub client_info: ClientInfo,
    pub submitted_at: String,
}
