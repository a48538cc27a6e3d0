//! Per-slot state machine.
//!
//! ```text
//! unprocessed -> marked -> skipped
//!                       -> loading -> task-shown -> answered -> fading -> removed
//!                                  |             -> closed
//!                                  -> no-task    -> closed
//!                                  -> closed
//! ```
//!
//! Every transition happens inside one synchronous call: the marker check
//! and write in [`SlotProcessor::process`], and the state checks in the
//! click handlers. Network calls and timers run as local tasks and re-check
//! the slot's state and attachment before touching the document.

use crate::client::TaskProvider;
use crate::config::{RenderMode, WidgetConfig};
use crate::document::{HostDocument, attr, has_attr, inner_html, remove_attr, set_attr};
use crate::error::{ErrorSink, WidgetError};
use crate::events::EventBridge;
use crate::identity::generate_id;
use crate::profile::{BrowsingProfile, ClientEnvironment};
use crate::render::{ACTION_ATTR, RenderedView, TaskRenderer, ViewAction};
use crate::scanner::SlotHandoff;
use crate::task::{Task, TaskResponse};
use crate::widget_debug;
use chrono::{SecondsFormat, Utc};
use kuchiki::NodeRef;
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

pub const PROCESSED_ATTR: &str = "data-hotlabel-processed";
pub const AD_ID_ATTR: &str = "data-hotlabel-ad-id";
pub const BACKUP_ATTR: &str = "data-hotlabel-original";

/// Delay between the thank-you view appearing and its fade-out.
pub const FADE_DELAY: Duration = Duration::from_millis(2_000);
/// Delay between fade-out and removal of the injected view.
pub const REMOVE_DELAY: Duration = Duration::from_millis(500);

const FADE_STYLE: &str = "opacity: 0; transition: opacity 0.5s ease";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    AlreadyProcessed,
    /// No longer in the document, e.g. replaced along with an enclosing slot.
    Detached,
    /// Marked but left alone by the replacement draw.
    Skipped,
    /// Carries the ad id assigned to the slot.
    Loading(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Loading,
    TaskShown,
    NoTask,
    Answered,
    Fading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WidgetStats {
    pub slots_processed: u64,
    pub tasks_completed: u64,
    pub earnings: f64,
}

struct SlotEntry {
    slot: NodeRef,
    /// Where views are mounted; the slot itself or a nested target.
    container: NodeRef,
    view: Option<NodeRef>,
    state: SlotState,
    task: Option<Task>,
    shown_at: Option<Instant>,
}

pub struct SlotProcessor {
    this: Weak<SlotProcessor>,
    document: HostDocument,
    config: Rc<WidgetConfig>,
    session: Session,
    provider: Rc<dyn TaskProvider>,
    errors: Rc<dyn ErrorSink>,
    environment: ClientEnvironment,
    renderer: TaskRenderer,
    events: EventBridge,
    slots: RefCell<HashMap<String, SlotEntry>>,
    stats: Cell<WidgetStats>,
    background: RefCell<Vec<JoinHandle<()>>>,
}

impl SlotProcessor {
    pub fn new(
        document: HostDocument,
        config: Rc<WidgetConfig>,
        session: Session,
        provider: Rc<dyn TaskProvider>,
        errors: Rc<dyn ErrorSink>,
        environment: ClientEnvironment,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            events: EventBridge::new(document.clone()),
            renderer: TaskRenderer::new(config.theme),
            document,
            config,
            session,
            provider,
            errors,
            environment,
            slots: RefCell::new(HashMap::new()),
            stats: Cell::new(WidgetStats::default()),
            background: RefCell::new(Vec::new()),
        })
    }

    pub fn stats(&self) -> WidgetStats {
        self.stats.get()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn slot_state(&self, ad_id: &str) -> Option<SlotState> {
        self.slots.borrow().get(ad_id).map(|entry| entry.state)
    }

    pub fn active_slots(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Entry point for a discovered slot. Must run inside a `LocalSet`.
    pub fn process(&self, slot: NodeRef) -> SlotOutcome {
        if has_attr(&slot, PROCESSED_ATTR) {
            return SlotOutcome::AlreadyProcessed;
        }
        if !self.document.contains(&slot) {
            return SlotOutcome::Detached;
        }
        set_attr(&slot, PROCESSED_ATTR, "true");
        self.bump_stats(|stats| stats.slots_processed += 1);

        if !rand::thread_rng().gen_bool(self.replacement_rate()) {
            widget_debug!(self.config.debug, "slot left to host content");
            return SlotOutcome::Skipped;
        }

        if !has_attr(&slot, BACKUP_ATTR) {
            let original = inner_html(&slot);
            if !original.trim().is_empty() {
                set_attr(&slot, BACKUP_ATTR, original);
            }
        }

        let ad_id = format!("hl-{}", generate_id());
        set_attr(&slot, AD_ID_ATTR, ad_id.as_str());
        let container = self.view_container(&slot);
        let view = self.mount(&container, self.renderer.loading(&ad_id), &ad_id);
        self.prune_detached();
        self.slots.borrow_mut().insert(
            ad_id.clone(),
            SlotEntry {
                slot,
                container,
                view,
                state: SlotState::Loading,
                task: None,
                shown_at: None,
            },
        );
        widget_debug!(self.config.debug, ad_id = %ad_id, "slot loading");

        if let Some(this) = self.this.upgrade() {
            let fetch_id = ad_id.clone();
            self.spawn_tracked(async move { this.load_task(fetch_id).await });
        }
        SlotOutcome::Loading(ad_id)
    }

    // `gen_bool` panics outside 0.0..=1.0.
    fn replacement_rate(&self) -> f64 {
        let rate = self.config.replacement_rate;
        if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) }
    }

    /// Forgets slots the host has removed from the document. Returns how
    /// many entries were dropped.
    pub fn prune_detached(&self) -> usize {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|_, entry| self.document.contains(&entry.slot));
        let pruned = before - slots.len();
        if pruned > 0 {
            debug!(pruned, "forgot detached slots");
        }
        pruned
    }

    fn view_container(&self, slot: &NodeRef) -> NodeRef {
        if self.config.render_mode == RenderMode::NestedTarget
            && let Ok(mut targets) = slot.select(&self.config.target_selector)
            && let Some(target) = targets.find(|el| el.as_node() != slot)
        {
            return target.as_node().clone();
        }
        slot.clone()
    }

    async fn load_task(self: Rc<Self>, ad_id: String) {
        let profile = BrowsingProfile::collect(&self.document, &self.environment);
        let result = self
            .provider
            .request_task(&self.session.session_id, &profile)
            .await;
        match result {
            Ok(Some(task)) => self.show_task(&ad_id, task),
            Ok(None) => self.show_no_task(&ad_id),
            Err(err) => {
                self.errors
                    .report(&WidgetError::TaskRequest(err), Some(ad_id.as_str()));
                self.show_task(&ad_id, Task::fallback());
            }
        }
    }

    fn show_task(&self, ad_id: &str, task: Task) {
        let mut slots = self.slots.borrow_mut();
        if !self.still_loading(&mut slots, ad_id) {
            return;
        }
        let Some(entry) = slots.get_mut(ad_id) else {
            return;
        };
        let view = self.renderer.task(&task, ad_id);
        entry.view = self.mount(&entry.container, view, ad_id);
        entry.state = SlotState::TaskShown;
        entry.shown_at = Some(Instant::now());
        widget_debug!(
            self.config.debug,
            ad_id,
            task_id = %task.task_id,
            fallback = task.is_fallback(),
            "task shown"
        );
        entry.task = Some(task);
    }

    fn show_no_task(&self, ad_id: &str) {
        let mut slots = self.slots.borrow_mut();
        if !self.still_loading(&mut slots, ad_id) {
            return;
        }
        let Some(entry) = slots.get_mut(ad_id) else {
            return;
        };
        entry.view = self.mount(&entry.container, self.renderer.no_task(ad_id), ad_id);
        entry.state = SlotState::NoTask;
        widget_debug!(self.config.debug, ad_id, "provider had no task");
    }

    /// Late results for closed or detached slots are dropped here. Detached
    /// slots are forgotten.
    fn still_loading(&self, slots: &mut HashMap<String, SlotEntry>, ad_id: &str) -> bool {
        let Some(entry) = slots.get(ad_id) else {
            debug!(ad_id, "slot closed before its task arrived");
            return false;
        };
        if !self.document.contains(&entry.slot) {
            debug!(ad_id, "slot detached while loading");
            slots.remove(ad_id);
            return false;
        }
        entry.state == SlotState::Loading
    }

    /// Option click. Only the first valid selection on a shown task counts.
    pub fn select_option(&self, ad_id: &str, choice: &str) {
        let (response, task_id) = {
            let mut slots = self.slots.borrow_mut();
            let Some(entry) = slots.get_mut(ad_id) else {
                return;
            };
            if entry.state != SlotState::TaskShown || !self.document.contains(&entry.slot) {
                return;
            }
            let Some(task) = entry.task.as_ref() else {
                return;
            };
            if !task.choices.contains_key(choice) {
                debug!(ad_id, choice, "ignoring unknown choice");
                return;
            }
            let elapsed = entry.shown_at.map(|at| at.elapsed()).unwrap_or_default();
            let response = TaskResponse {
                task_id: task.task_id.clone(),
                session_id: self.session.session_id.clone(),
                user_id: self.session.user_id.clone(),
                publisher_id: self.config.publisher_id.clone(),
                category: task.category,
                selected_choice: choice.to_string(),
                response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                client_info: self.environment.client_info(),
                submitted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            };
            let reward = task.category.reward();
            let task_id = task.task_id.clone();

            entry.state = SlotState::Answered;
            entry.view = self.mount(&entry.container, self.renderer.thank_you(ad_id), ad_id);
            self.bump_stats(|stats| {
                stats.tasks_completed += 1;
                stats.earnings += reward;
            });
            (response, task_id)
        };

        info!(ad_id, task_id = %task_id, choice, "task answered");
        self.submit(ad_id, response);
        self.events.emit_completed(ad_id, &task_id);
        self.schedule_removal(ad_id);
    }

    /// Fire and forget. Not tracked, so teardown does not drop answers.
    fn submit(&self, ad_id: &str, response: TaskResponse) {
        let provider = Rc::clone(&self.provider);
        let errors = Rc::clone(&self.errors);
        let ad_id = ad_id.to_string();
        tokio::task::spawn_local(async move {
            if let Err(err) = provider.submit_response(&response).await {
                errors.report(&WidgetError::Submission(err), Some(ad_id.as_str()));
            }
        });
    }

    fn schedule_removal(&self, ad_id: &str) {
        let this = self.this.clone();
        let ad_id = ad_id.to_string();
        self.spawn_tracked(async move {
            sleep(FADE_DELAY).await;
            match this.upgrade() {
                Some(processor) if processor.begin_fade(&ad_id) => {}
                _ => return,
            }
            sleep(REMOVE_DELAY).await;
            if let Some(processor) = this.upgrade() {
                processor.finish_removal(&ad_id);
            }
        });
    }

    fn begin_fade(&self, ad_id: &str) -> bool {
        let mut slots = self.slots.borrow_mut();
        let Some(entry) = slots.get_mut(ad_id) else {
            return false;
        };
        if entry.state != SlotState::Answered {
            return false;
        }
        match &entry.view {
            Some(view) if self.document.contains(view) => {
                set_attr(view, "style", FADE_STYLE);
                entry.state = SlotState::Fading;
                true
            }
            _ => {
                slots.remove(ad_id);
                false
            }
        }
    }

    fn finish_removal(&self, ad_id: &str) {
        let entry = {
            let mut slots = self.slots.borrow_mut();
            match slots.get(ad_id) {
                Some(entry) if entry.state == SlotState::Fading => slots.remove(ad_id),
                _ => None,
            }
        };
        if let Some(view) = entry.and_then(|entry| entry.view)
            && self.document.contains(&view)
        {
            self.document.remove(&view);
            widget_debug!(self.config.debug, ad_id, "task view removed");
        }
    }

    /// Close click. Restores the backed-up markup and clears the slot's
    /// attributes so a later rescan may pick it up again; without a backup
    /// only the injected view goes away.
    pub fn close(&self, ad_id: &str) {
        let entry = {
            let mut slots = self.slots.borrow_mut();
            let closable = slots.get(ad_id).is_some_and(|entry| {
                matches!(
                    entry.state,
                    SlotState::Loading | SlotState::TaskShown | SlotState::NoTask
                )
            });
            if !closable {
                return;
            }
            match slots.remove(ad_id) {
                Some(entry) => entry,
                None => return,
            }
        };

        if self.document.contains(&entry.slot) {
            match attr(&entry.slot, BACKUP_ATTR) {
                Some(original) => {
                    self.document.replace_children(&entry.slot, &original);
                    for name in [PROCESSED_ATTR, AD_ID_ATTR, BACKUP_ATTR] {
                        remove_attr(&entry.slot, name);
                    }
                }
                None => {
                    if let Some(view) = &entry.view {
                        self.document.remove(view);
                    }
                }
            }
        }

        let task_id = entry.task.as_ref().map(|task| task.task_id.as_str());
        info!(ad_id, task_id, "task closed");
        self.events.emit_closed(ad_id, task_id);
    }

    /// Replaces the container's children with `view` and wires its actions
    /// to this slot's ad id. Returns the view root.
    fn mount(&self, container: &NodeRef, view: RenderedView, ad_id: &str) -> Option<NodeRef> {
        let root = self
            .document
            .replace_children(container, &view.html)
            .into_iter()
            .find(|node| node.as_element().is_some())?;
        self.bind_actions(&root, &view.actions, ad_id);
        Some(root)
    }

    fn bind_actions(&self, root: &NodeRef, actions: &[ViewAction], ad_id: &str) {
        let Ok(targets) = root.select(&format!("[{ACTION_ATTR}]")) else {
            return;
        };
        let targets: Vec<NodeRef> = targets.map(|el| el.as_node().clone()).collect();
        for target in targets {
            let Some(action) = attr(&target, ACTION_ATTR)
                .and_then(|index| index.parse::<usize>().ok())
                .and_then(|index| actions.get(index))
                .cloned()
            else {
                continue;
            };
            let processor = self.this.clone();
            let ad_id = ad_id.to_string();
            self.document.on_click(
                &target,
                Rc::new(move || {
                    let Some(processor) = processor.upgrade() else {
                        return;
                    };
                    match &action {
                        ViewAction::Select(choice) => processor.select_option(&ad_id, choice),
                        ViewAction::Close => processor.close(&ad_id),
                    }
                }),
            );
        }
    }

    fn bump_stats(&self, update: impl FnOnce(&mut WidgetStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }

    fn spawn_tracked(&self, task: impl Future<Output = ()> + 'static) {
        let handle = tokio::task::spawn_local(task);
        let mut background = self.background.borrow_mut();
        background.retain(|handle| !handle.is_finished());
        background.push(handle);
    }

    /// Aborts pending fetches and fade timers. Views stay as they are.
    pub fn shutdown(&self) {
        for handle in self.background.borrow_mut().drain(..) {
            handle.abort();
        }
    }
}

impl SlotHandoff for SlotProcessor {
    fn hand_off(&self, slot: NodeRef) -> SlotOutcome {
        self.process(slot)
    }
}
