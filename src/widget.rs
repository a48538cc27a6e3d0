use crate::client::{HttpTaskClient, TaskProvider};
use crate::config::WidgetConfig;
use crate::document::HostDocument;
use crate::error::{ErrorSink, TracingErrorSink, WidgetError};
use crate::identity::{IdentityStore, KeyValueStore, MemoryStore, generate_session_id};
use crate::processor::{Session, SlotProcessor, SlotState, WidgetStats};
use crate::profile::ClientEnvironment;
use crate::scanner::{SlotHandoff, SlotScanner};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Where tasks come from once the widget is initialized.
#[derive(Clone, Default)]
pub enum ProviderSource {
    /// `HttpTaskClient` against `WidgetConfig::api_base_url`.
    #[default]
    Http,
    Custom(Rc<dyn TaskProvider>),
}

/// Collaborators the embedding application hands to the widget.
#[derive(Clone)]
pub struct WidgetServices {
    pub provider: ProviderSource,
    pub storage: Rc<dyn KeyValueStore>,
    pub errors: Rc<dyn ErrorSink>,
    pub environment: ClientEnvironment,
}

impl Default for WidgetServices {
    fn default() -> Self {
        Self {
            provider: ProviderSource::Http,
            storage: Rc::new(MemoryStore::default()),
            errors: Rc::new(TracingErrorSink),
            environment: ClientEnvironment::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized,
    AlreadyInitialized,
}

struct ActiveWidget {
    config: Rc<WidgetConfig>,
    processor: Rc<SlotProcessor>,
    scanner: Rc<SlotScanner>,
    observer: JoinHandle<()>,
    health_probe: JoinHandle<()>,
}

/// One widget instance bound to one host document. The embedding
/// application owns its lifecycle; there is no global instance.
pub struct Widget {
    document: HostDocument,
    services: WidgetServices,
    active: RefCell<Option<ActiveWidget>>,
}

impl Widget {
    pub fn new(document: HostDocument, services: WidgetServices) -> Self {
        Self {
            document,
            services,
            active: RefCell::new(None),
        }
    }

    pub fn document(&self) -> &HostDocument {
        &self.document
    }

    /// Validates `config`, starts observing the document and processes the
    /// slots already present. Must run inside a `LocalSet`.
    ///
    /// A rejected config leaves the widget uninitialized. Calling this again
    /// while initialized changes nothing.
    pub fn init(&self, config: WidgetConfig) -> Result<InitOutcome, WidgetError> {
        if self.active.borrow().is_some() {
            info!("widget already initialized; ignoring init");
            return Ok(InitOutcome::AlreadyInitialized);
        }
        if let Err(err) = config.validate() {
            error!(%err, "widget configuration rejected");
            return Err(err.into());
        }

        let provider: Rc<dyn TaskProvider> = match &self.services.provider {
            ProviderSource::Http => Rc::new(
                HttpTaskClient::new(config.api_base_url.clone(), config.request_timeout)
                    .map_err(WidgetError::Client)?,
            ),
            ProviderSource::Custom(provider) => Rc::clone(provider),
        };
        let (user_id, storage_err) =
            IdentityStore::new(Rc::clone(&self.services.storage)).resolve_user_id();
        if let Some(err) = storage_err {
            self.services.errors.report(&WidgetError::from(err), None);
        }
        let session = Session {
            user_id,
            session_id: generate_session_id(),
        };
        let config = Rc::new(config);
        let processor = SlotProcessor::new(
            self.document.clone(),
            Rc::clone(&config),
            session,
            Rc::clone(&provider),
            Rc::clone(&self.services.errors),
            self.services.environment.clone(),
        );
        let handoff: Rc<dyn SlotHandoff> = processor.clone();
        let scanner = Rc::new(SlotScanner::new(
            self.document.clone(),
            &config.slot_selector,
            handoff,
        )?);

        // Subscribe before scanning so nothing inserted in between is missed.
        let observer = scanner.observe();
        let started = match scanner.scan_existing() {
            Ok(started) => started,
            Err(err) => {
                observer.abort();
                return Err(err.into());
            }
        };
        let health_probe = self.spawn_health_probe(provider);

        info!(
            publisher_id = %config.publisher_id,
            session_id = %processor.session().session_id,
            slots = started,
            "widget initialized"
        );
        *self.active.borrow_mut() = Some(ActiveWidget {
            config,
            processor,
            scanner,
            observer,
            health_probe,
        });
        Ok(InitOutcome::Initialized)
    }

    fn spawn_health_probe(&self, provider: Rc<dyn TaskProvider>) -> JoinHandle<()> {
        let errors = Rc::clone(&self.services.errors);
        tokio::task::spawn_local(async move {
            match provider.health().await {
                Ok(()) => debug!("task provider healthy"),
                Err(err) => errors.report(&WidgetError::HealthProbe(err), None),
            }
        })
    }

    /// Scans the document again, e.g. after the host restored slots by
    /// closing them or removed some. Returns how many slots started loading.
    pub fn rescan(&self) -> Result<usize, WidgetError> {
        let (scanner, processor) = match self.active.borrow().as_ref() {
            Some(active) => (Rc::clone(&active.scanner), Rc::clone(&active.processor)),
            None => return Ok(0),
        };
        processor.prune_detached();
        Ok(scanner.scan_existing()?)
    }

    /// Stops observation and pending timers. Views already in the document
    /// stay where they are. Returns whether the widget was running.
    pub fn teardown(&self) -> bool {
        let Some(active) = self.active.borrow_mut().take() else {
            return false;
        };
        active.observer.abort();
        active.health_probe.abort();
        active.processor.shutdown();
        info!(
            session_id = %active.processor.session().session_id,
            "widget torn down"
        );
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.active.borrow().is_some()
    }

    pub fn config(&self) -> Option<Rc<WidgetConfig>> {
        self.active
            .borrow()
            .as_ref()
            .map(|active| Rc::clone(&active.config))
    }

    pub fn session(&self) -> Option<Session> {
        self.active
            .borrow()
            .as_ref()
            .map(|active| active.processor.session().clone())
    }

    pub fn stats(&self) -> WidgetStats {
        self.active
            .borrow()
            .as_ref()
            .map(|active| active.processor.stats())
            .unwrap_or_default()
    }

    /// How many times the document has been scanned for existing slots.
    pub fn scan_count(&self) -> usize {
        self.active
            .borrow()
            .as_ref()
            .map_or(0, |active| active.scanner.scan_runs())
    }

    pub fn slot_state(&self, ad_id: &str) -> Option<SlotState> {
        self.active
            .borrow()
            .as_ref()
            .and_then(|active| active.processor.slot_state(ad_id))
    }

    /// Answers a shown task as if the user clicked the option.
    pub fn select_option(&self, ad_id: &str, choice: &str) {
        let processor = self.processor();
        if let Some(processor) = processor {
            processor.select_option(ad_id, choice);
        }
    }

    /// Closes a slot as if the user clicked its close button.
    pub fn close(&self, ad_id: &str) {
        let processor = self.processor();
        if let Some(processor) = processor {
            processor.close(ad_id);
        }
    }

    // Cloned out so no borrow of `active` is held while handlers run; they
    // may dispatch events whose listeners call back into the widget.
    fn processor(&self) -> Option<Rc<SlotProcessor>> {
        self.active
            .borrow()
            .as_ref()
            .map(|active| Rc::clone(&active.processor))
    }
}

impl Drop for Widget {
    fn drop(&mut self) {
        self.teardown();
    }
}
