use crate::client::TaskClientError;
use crate::config::ConfigError;
use crate::document::DocumentError;
use crate::identity::StorageError;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum WidgetError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("task request failed: {0}")]
    TaskRequest(#[source] TaskClientError),
    #[error("response submission failed: {0}")]
    Submission(#[source] TaskClientError),
    #[error("task provider health probe failed: {0}")]
    HealthProbe(#[source] TaskClientError),
    #[error("task client setup failed: {0}")]
    Client(#[source] TaskClientError),
    #[error("document error: {0}")]
    Document(#[from] DocumentError),
    #[error("identity storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Hook for failures the widget recovers from on its own (fallback tasks,
/// dropped submissions, failed probes). The host installs one to observe or
/// aggregate them; nothing here is ever shown to the user.
pub trait ErrorSink {
    fn report(&self, error: &WidgetError, ad_id: Option<&str>);
}

/// Default sink: one structured `warn!` per recovered failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &WidgetError, ad_id: Option<&str>) {
        warn!(
            target: "hotlabel_widget.errors",
            ad_id = ad_id.unwrap_or("-"),
            %error,
            "recovered widget failure"
        );
    }
}
