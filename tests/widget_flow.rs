use async_trait::async_trait;
use hotlabel_widget::document::{CustomEvent, HostDocument, attr, has_attr, inner_html};
use hotlabel_widget::processor::{AD_ID_ATTR, BACKUP_ATTR, FADE_DELAY, PROCESSED_ATTR, REMOVE_DELAY};
use hotlabel_widget::profile::BrowsingProfile;
use hotlabel_widget::task::{Choices, TaskCategory, TaskOrigin, TaskStatus};
use hotlabel_widget::{
    InitOutcome, ProviderSource, SlotState, Task, TaskClientError, TaskProvider, TaskResponse,
    Widget, WidgetConfig, WidgetServices,
};
use kuchiki::NodeRef;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;

#[derive(Default)]
struct FakeProvider {
    fail_requests: Cell<bool>,
    delay: Cell<Duration>,
    requests: Cell<usize>,
    submissions: RefCell<Vec<TaskResponse>>,
}

#[async_trait(?Send)]
impl TaskProvider for FakeProvider {
    async fn request_task(
        &self,
        session_id: &str,
        _profile: &BrowsingProfile,
    ) -> Result<Option<Task>, TaskClientError> {
        assert!(!session_id.is_empty());
        self.requests.set(self.requests.get() + 1);
        let delay = self.delay.get();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_requests.get() {
            return Err(TaskClientError::Status {
                status: 503,
                url: "http://provider.test/v1/tasks/request".into(),
            });
        }
        Ok(Some(mock_task(self.requests.get())))
    }

    async fn submit_response(&self, response: &TaskResponse) -> Result<(), TaskClientError> {
        self.submissions.borrow_mut().push(response.clone());
        Ok(())
    }

    async fn health(&self) -> Result<(), TaskClientError> {
        Ok(())
    }
}

fn mock_task(n: usize) -> Task {
    Task {
        task_id: format!("mock-{n}"),
        language: "en".into(),
        category: TaskCategory::Text,
        prompt: "Is this review positive?".into(),
        image_url: None,
        text: Some("Great food, slow service.".into()),
        choices: Choices::from_pairs([("a", "Yes"), ("b", "No"), ("c", "Mixed")]),
        status: TaskStatus::Pending,
        origin: TaskOrigin::Provider,
    }
}

struct Page {
    doc: HostDocument,
    provider: Rc<FakeProvider>,
    widget: Widget,
    events: Rc<RefCell<Vec<CustomEvent>>>,
}

const ORIGINAL: &str = "<a href=\"/buy\"><img src=\"/banner.png\"> Buy now</a>";

fn page(body: &str) -> Page {
    let doc = HostDocument::parse(&format!("<html><head><title>Demo</title></head><body>{body}</body></html>"));
    let events = Rc::new(RefCell::new(Vec::new()));
    for name in ["task-completed", "task-closed"] {
        let sink = Rc::clone(&events);
        doc.add_event_listener(
            name,
            Rc::new(move |event: &CustomEvent| sink.borrow_mut().push(event.clone())),
        );
    }
    let provider = Rc::new(FakeProvider::default());
    let widget = Widget::new(
        doc.clone(),
        WidgetServices {
            provider: ProviderSource::Custom(Rc::clone(&provider) as Rc<dyn TaskProvider>),
            ..WidgetServices::default()
        },
    );
    Page {
        doc,
        provider,
        widget,
        events,
    }
}

fn config() -> WidgetConfig {
    WidgetConfig {
        slot_selector: ".slot".into(),
        ..WidgetConfig::new("pub-1")
    }
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn first(doc: &HostDocument, selector: &str) -> Option<NodeRef> {
    doc.select_first(selector).unwrap()
}

fn ad_id(slot: &NodeRef) -> String {
    attr(slot, AD_ID_ATTR).expect("slot has an ad id")
}

fn option_labels(doc: &HostDocument) -> Vec<String> {
    doc.select_all(".hotlabel-option")
        .unwrap()
        .iter()
        .map(|node| node.text_contents())
        .collect()
}

#[tokio::test]
async fn present_slot_loads_then_shows_task_options() {
    LocalSet::new()
        .run_until(async {
            let p = page(r#"<div class="slot"></div>"#);
            assert_eq!(p.widget.init(config()).unwrap(), InitOutcome::Initialized);

            let slot = first(&p.doc, ".slot").unwrap();
            assert!(has_attr(&slot, PROCESSED_ATTR));
            assert!(first(&p.doc, ".slot .hotlabel-spinner").is_some());

            settle().await;
            assert!(first(&p.doc, ".slot .hotlabel-spinner").is_none());
            assert_eq!(option_labels(&p.doc), ["Yes", "No", "Mixed"]);
            assert!(first(&p.doc, ".hotlabel-text").is_some());
            assert_eq!(p.widget.slot_state(&ad_id(&slot)), Some(SlotState::TaskShown));
        })
        .await;
}

#[tokio::test]
async fn rejected_request_shows_fallback_task() {
    LocalSet::new()
        .run_until(async {
            let p = page(r#"<div class="slot"></div>"#);
            p.provider.fail_requests.set(true);
            p.widget.init(config()).unwrap();
            settle().await;

            let slot = first(&p.doc, ".slot").unwrap();
            assert_eq!(p.widget.slot_state(&ad_id(&slot)), Some(SlotState::TaskShown));
            assert!(first(&p.doc, ".slot .hotlabel-spinner").is_none());
            let prompt = first(&p.doc, ".hotlabel-prompt").unwrap().text_contents();
            assert!(!prompt.trim().is_empty());
            assert!(!option_labels(&p.doc).is_empty());
            assert!(first(&p.doc, ".hotlabel-demo-badge").is_some());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn answering_submits_once_emits_completion_and_removes_view() {
    LocalSet::new()
        .run_until(async {
            let p = page(r#"<div class="slot"></div>"#);
            p.widget.init(config()).unwrap();
            settle().await;
            let slot = first(&p.doc, ".slot").unwrap();
            let ad_id = ad_id(&slot);

            let option = first(&p.doc, r#".hotlabel-option[data-choice="a"]"#).unwrap();
            assert!(p.doc.click(&option));
            // The old option node is gone; clicking it again does nothing.
            assert!(!p.doc.click(&option));
            p.widget.select_option(&ad_id, "b");
            settle().await;

            let submissions = p.provider.submissions.borrow().clone();
            assert_eq!(submissions.len(), 1);
            assert_eq!(submissions[0].selected_choice, "a");
            assert_eq!(submissions[0].task_id, "mock-1");

            {
                let events = p.events.borrow();
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].name, "task-completed");
                assert_eq!(events[0].detail["taskId"], "mock-1");
                assert_eq!(events[0].detail["adId"], ad_id.as_str());
            }
            assert!(first(&p.doc, ".hotlabel-thank-you").is_some());

            tokio::time::sleep(FADE_DELAY + REMOVE_DELAY + Duration::from_millis(50)).await;
            settle().await;
            assert!(first(&p.doc, ".hotlabel-task").is_none());
            assert!(first(&p.doc, ".slot").is_some());
            let stats = p.widget.stats();
            assert_eq!(stats.tasks_completed, 1);
            assert!((stats.earnings - 0.02).abs() < 1e-9);
        })
        .await;
}

#[tokio::test]
async fn close_restores_original_markup_and_clears_marker() {
    LocalSet::new()
        .run_until(async {
            let p = page(&format!(r#"<div class="slot">{ORIGINAL}</div>"#));
            let before = inner_html(&first(&p.doc, ".slot").unwrap());
            p.widget.init(config()).unwrap();
            settle().await;

            let slot = first(&p.doc, ".slot").unwrap();
            let ad_id = ad_id(&slot);
            assert_eq!(p.widget.slot_state(&ad_id), Some(SlotState::TaskShown));
            let close = first(&p.doc, ".hotlabel-close").unwrap();
            assert!(p.doc.click(&close));

            assert_eq!(inner_html(&slot), before);
            assert!(!has_attr(&slot, PROCESSED_ATTR));
            assert!(!has_attr(&slot, AD_ID_ATTR));
            assert!(!has_attr(&slot, BACKUP_ATTR));
            assert!(p.provider.submissions.borrow().is_empty());

            let events = p.events.borrow();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].name, "task-closed");
            assert_eq!(events[0].detail["adId"], ad_id.as_str());
            assert_eq!(events[0].detail["taskId"], "mock-1");
        })
        .await;
}

#[tokio::test]
async fn closed_slot_is_picked_up_again_on_rescan() {
    LocalSet::new()
        .run_until(async {
            let p = page(&format!(r#"<div class="slot">{ORIGINAL}</div>"#));
            p.widget.init(config()).unwrap();
            settle().await;
            let first_id = ad_id(&first(&p.doc, ".slot").unwrap());
            p.widget.close(&first_id);

            assert_eq!(p.widget.rescan().unwrap(), 1);
            let slot = first(&p.doc, ".slot").unwrap();
            assert_ne!(ad_id(&slot), first_id);
            assert_eq!(attr(&slot, BACKUP_ATTR).as_deref(), Some(ORIGINAL));
            assert_eq!(p.widget.scan_count(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn slot_inserted_after_init_starts_loading() {
    LocalSet::new()
        .run_until(async {
            let p = page("<main></main>");
            p.provider.delay.set(Duration::from_secs(1));
            p.widget.init(config()).unwrap();
            assert_eq!(p.provider.requests.get(), 0);

            let main = first(&p.doc, "main").unwrap();
            p.doc.append_html(
                &main,
                r#"<article><div class="slot" id="late">house ad</div><div class="slot" id="later"></div></article>"#,
            );
            settle().await;

            for id in ["#late", "#later"] {
                let slot = first(&p.doc, id).unwrap();
                assert!(has_attr(&slot, PROCESSED_ATTR), "{id} marked");
                assert_eq!(p.widget.slot_state(&ad_id(&slot)), Some(SlotState::Loading));
                assert!(first(&p.doc, &format!("{id} .hotlabel-spinner")).is_some());
            }
            assert_eq!(p.provider.requests.get(), 2);
        })
        .await;
}

#[tokio::test]
async fn second_init_is_a_no_op() {
    LocalSet::new()
        .run_until(async {
            let p = page(r#"<div class="slot"></div><div class="slot"></div>"#);
            assert_eq!(p.widget.init(config()).unwrap(), InitOutcome::Initialized);
            let session = p.widget.session().unwrap();
            assert_eq!(
                p.widget.init(config()).unwrap(),
                InitOutcome::AlreadyInitialized
            );
            settle().await;

            assert_eq!(p.widget.scan_count(), 1);
            assert_eq!(p.widget.session().unwrap(), session);
            assert_eq!(p.provider.requests.get(), 2);
            assert_eq!(p.widget.stats().slots_processed, 2);
        })
        .await;
}

#[tokio::test]
async fn reinserting_a_processed_slot_does_not_reprocess_it() {
    LocalSet::new()
        .run_until(async {
            let p = page(r#"<div class="slot"></div><section></section>"#);
            p.widget.init(config()).unwrap();
            settle().await;
            let slot = first(&p.doc, ".slot").unwrap();
            let id = ad_id(&slot);

            // Host re-renders a copy of the slot, marker included.
            let section = first(&p.doc, "section").unwrap();
            p.doc.append_html(&section, &slot.to_string());
            p.widget.rescan().unwrap();
            settle().await;

            assert_eq!(p.provider.requests.get(), 1);
            assert_eq!(p.widget.stats().slots_processed, 1);
            assert_eq!(p.widget.slot_state(&id), Some(SlotState::TaskShown));
        })
        .await;
}

#[tokio::test]
async fn nested_slots_issue_one_request_per_visible_slot() {
    LocalSet::new()
        .run_until(async {
            let p = page(r#"<div class="slot" id="outer"><div class="slot" id="inner">x</div></div>"#);
            p.widget.init(config()).unwrap();
            settle().await;

            assert!(first(&p.doc, "#inner").is_none());
            assert_eq!(p.provider.requests.get(), 1);
            assert_eq!(p.widget.stats().slots_processed, 1);
            let outer = first(&p.doc, "#outer").unwrap();
            assert_eq!(p.widget.slot_state(&ad_id(&outer)), Some(SlotState::TaskShown));
        })
        .await;
}

#[tokio::test]
async fn rescan_forgets_slots_the_host_removed() {
    LocalSet::new()
        .run_until(async {
            let p = page(r#"<div class="slot" id="one"></div><div class="slot" id="two"></div>"#);
            p.widget.init(config()).unwrap();
            settle().await;
            let one = first(&p.doc, "#one").unwrap();
            let id = ad_id(&one);
            assert_eq!(p.widget.slot_state(&id), Some(SlotState::TaskShown));

            p.doc.remove(&one);
            assert_eq!(p.widget.rescan().unwrap(), 0);
            assert_eq!(p.widget.slot_state(&id), None);
            let two = first(&p.doc, "#two").unwrap();
            assert_eq!(p.widget.slot_state(&ad_id(&two)), Some(SlotState::TaskShown));
        })
        .await;
}
