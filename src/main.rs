use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use hotlabel_widget::document::{CustomEvent, HostDocument, attr};
use hotlabel_widget::events::{TASK_CLOSED, TASK_COMPLETED};
use hotlabel_widget::identity::{FileStore, KeyValueStore, MemoryStore};
use hotlabel_widget::processor::{AD_ID_ATTR, FADE_DELAY, REMOVE_DELAY};
use hotlabel_widget::profile::ClientEnvironment;
use hotlabel_widget::{SlotState, Widget, WidgetConfig, WidgetServices, provider_stub};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hotlabel", version, about = "Run the HotLabel slot widget against an HTML page")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a page, let the widget fill its slots and write the result.
    Render(RenderArgs),
    /// Serve demo tasks locally.
    StubProvider {
        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: SocketAddr,
    },
}

#[derive(Args)]
struct RenderArgs {
    #[arg(long)]
    page: PathBuf,
    /// TOML widget config; `HOTLABEL_*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    publisher_id: Option<String>,
    /// Answer every shown task with this choice key.
    #[arg(long)]
    answer: Option<String>,
    #[arg(long)]
    output: Option<PathBuf>,
    /// JSON file that keeps the user id between runs.
    #[arg(long)]
    state_file: Option<PathBuf>,
    /// How long to wait for tasks to load. Defaults to the request timeout
    /// plus a short margin.
    #[arg(long)]
    wait_ms: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Render(args) => LocalSet::new().run_until(render(args)).await,
        Command::StubProvider { bind } => provider_stub::serve(bind).await,
    }
}

async fn render(args: RenderArgs) -> anyhow::Result<()> {
    let html = std::fs::read_to_string(&args.page)
        .with_context(|| format!("reading page {}", args.page.display()))?;
    let mut config = match &args.config {
        Some(path) => WidgetConfig::from_toml_file(path)?,
        None => WidgetConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(publisher_id) = args.publisher_id {
        config.publisher_id = publisher_id;
    }

    let document = HostDocument::parse(&html);
    for name in [TASK_COMPLETED, TASK_CLOSED] {
        document.add_event_listener(
            name,
            Rc::new(|event: &CustomEvent| info!(event = %event.name, detail = %event.detail, "outcome")),
        );
    }
    let storage: Rc<dyn KeyValueStore> = match args.state_file {
        Some(path) => Rc::new(FileStore::new(path)),
        None => Rc::new(MemoryStore::default()),
    };
    let widget = Widget::new(
        document.clone(),
        WidgetServices {
            storage,
            environment: ClientEnvironment::from_env(),
            ..WidgetServices::default()
        },
    );
    let wait = load_wait(args.wait_ms, &config);
    widget.init(config).context("widget init failed")?;
    tokio::time::sleep(wait).await;

    if let Some(choice) = &args.answer {
        let mut answered = 0;
        for slot in document.select_all(&format!("[{AD_ID_ATTR}]"))? {
            if let Some(ad_id) = attr(&slot, AD_ID_ATTR)
                && widget.slot_state(&ad_id) == Some(SlotState::TaskShown)
            {
                widget.select_option(&ad_id, choice);
                answered += 1;
            }
        }
        info!(answered, choice = %choice, "answered shown tasks");
        // Lets submissions finish and thank-you views clear.
        tokio::time::sleep(FADE_DELAY + REMOVE_DELAY + Duration::from_millis(100)).await;
    }

    let stats = widget.stats();
    widget.teardown();
    let output = document.to_html();
    match &args.output {
        Some(path) => std::fs::write(path, output)
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{output}"),
    }
    eprintln!(
        "slots processed: {}, tasks completed: {}, earnings: {:.2}",
        stats.slots_processed, stats.tasks_completed, stats.earnings
    );
    Ok(())
}

const LOAD_MARGIN: Duration = Duration::from_millis(500);

fn load_wait(wait_ms: Option<u64>, config: &WidgetConfig) -> Duration {
    wait_ms.map_or(config.request_timeout + LOAD_MARGIN, Duration::from_millis)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
