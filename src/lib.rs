//! Slot widget that swaps ad slots in a host document for labeling
//! micro-tasks.
//!
//! The host builds a [`Widget`] over its [`HostDocument`], calls
//! [`Widget::init`] from inside a tokio `LocalSet`, and listens for the
//! `task-completed` and `task-closed` document events.

pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod identity;
pub mod processor;
pub mod profile;
pub mod provider_stub;
pub mod render;
pub mod scanner;
pub mod task;
pub mod widget;

pub use client::{HttpTaskClient, TaskClientError, TaskProvider};
pub use config::{ConfigError, RenderMode, Theme, WidgetConfig};
pub use document::{CustomEvent, HostDocument};
pub use error::{ErrorSink, TracingErrorSink, WidgetError};
pub use processor::{SlotState, WidgetStats};
pub use task::{Task, TaskResponse};
pub use widget::{InitOutcome, ProviderSource, Widget, WidgetServices};

/// Lifecycle tracing that only fires when the widget config enables debug.
#[macro_export]
macro_rules! widget_debug {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            ::tracing::debug!(target: "hotlabel_widget::lifecycle", $($arg)+);
        }
    };
}
