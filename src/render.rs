//! Markup for the views the widget injects into a slot.
//!
//! Rendering is pure: each view comes back as an HTML string plus the list
//! of actions its clickable elements trigger. Clickable elements carry
//! `data-hotlabel-action="<index into actions>"`; the processor binds the
//! handlers after inserting the markup.

use crate::config::Theme;
use crate::task::{Task, TaskCategory};
use maud::{Markup, html};

pub const ACTION_ATTR: &str = "data-hotlabel-action";
pub const VIEW_ATTR: &str = "data-hotlabel-view";

const FOOTER_CAPTION: &str = "Help train AI by answering this question";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewAction {
    Select(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct RenderedView {
    pub html: String,
    pub actions: Vec<ViewAction>,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskRenderer {
    theme: Theme,
}

impl TaskRenderer {
    pub fn new(theme: Theme) -> Self {
        Self { theme }
    }

    fn root_class(&self, state: &str) -> String {
        format!("hotlabel-task hotlabel-theme-{} {state}", self.theme.as_str())
    }

    pub fn loading(&self, ad_id: &str) -> RenderedView {
        let markup = html! {
            div class=(self.root_class("hotlabel-loading")) data-hotlabel-view=(ad_id) {
                (header(Some(0)))
                div class="hotlabel-content" {
                    div class="hotlabel-spinner" {}
                    div class="hotlabel-message" { "Loading task..." }
                }
            }
        };
        RenderedView {
            html: markup.into_string(),
            actions: vec![ViewAction::Close],
        }
    }

    pub fn task(&self, task: &Task, ad_id: &str) -> RenderedView {
        let mut actions = vec![ViewAction::Close];
        actions.extend(
            task.choices
                .iter()
                .map(|choice| ViewAction::Select(choice.key.clone())),
        );
        let markup = html! {
            div class=(self.root_class("hotlabel-active")) data-hotlabel-view=(ad_id) data-task-id=(task.task_id) {
                (header(Some(0)))
                div class="hotlabel-content" {
                    @if task.is_fallback() {
                        span class="hotlabel-demo-badge" { "Demo" }
                    }
                    div class="hotlabel-prompt" { (task.prompt) }
                    (media(task))
                    div class="hotlabel-options" {
                        @for (i, choice) in task.choices.iter().enumerate() {
                            button class="hotlabel-option" type="button"
                                data-choice=(choice.key) data-hotlabel-action=(i + 1) {
                                (choice.label)
                            }
                        }
                    }
                }
                div class="hotlabel-footer" { (FOOTER_CAPTION) }
            }
        };
        RenderedView {
            html: markup.into_string(),
            actions,
        }
    }

    pub fn no_task(&self, ad_id: &str) -> RenderedView {
        let markup = html! {
            div class=(self.root_class("hotlabel-empty")) data-hotlabel-view=(ad_id) {
                (header(Some(0)))
                div class="hotlabel-content hotlabel-no-task" {
                    div class="hotlabel-message" { "No tasks available right now" }
                    div class="hotlabel-submessage" { "Check back soon." }
                }
            }
        };
        RenderedView {
            html: markup.into_string(),
            actions: vec![ViewAction::Close],
        }
    }

    /// Shown after an answer. Has no close button; it removes itself.
    pub fn thank_you(&self, ad_id: &str) -> RenderedView {
        let markup = html! {
            div class=(self.root_class("hotlabel-done")) data-hotlabel-view=(ad_id) {
                (header(None))
                div class="hotlabel-content hotlabel-thank-you" {
                    div class="hotlabel-check" { "✓" }
                    div class="hotlabel-message" { "Thank you!" }
                    div class="hotlabel-submessage" { "Your response helps improve AI systems." }
                }
            }
        };
        RenderedView {
            html: markup.into_string(),
            actions: Vec::new(),
        }
    }
}

fn header(close_action: Option<usize>) -> Markup {
    html! {
        div class="hotlabel-header" {
            div class="hotlabel-logo" { "HotLabel" }
            @if let Some(index) = close_action {
                button class="hotlabel-close" type="button" aria-label="Close" data-hotlabel-action=(index) { "×" }
            }
        }
    }
}

fn media(task: &Task) -> Markup {
    html! {
        @match task.category {
            TaskCategory::Image | TaskCategory::Vqa => {
                @if let Some(url) = &task.image_url {
                    div class="hotlabel-media" {
                        img class="hotlabel-image" src=(url) alt="Task image";
                    }
                }
            }
            TaskCategory::Text | TaskCategory::TrueFalse => {
                @if let Some(text) = &task.text {
                    div class="hotlabel-text" { (text) }
                }
            }
            TaskCategory::Other => {}
        }
    }
}
