mod i18n;

use anyhow::Context;
use autosave_sync::core::config::SyncConfig;
use autosave_sync::core::engine::SyncEngine;
use autosave_sync::core::events::SyncEvent;
use autosave_sync::core::model::{BatchEntry, BatchResults, Task, TaskDraft, TaskOrder, TaskStats, TaskStatus};
use autosave_sync::core::store::SqliteStore;
use autosave_sync::remote::http::HttpBackend;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use i18n::{get_messages, Locale, Messages};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn orders_arg(help: &'static str) -> Arg {
    Arg::new("orders")
        .help(help)
        .action(ArgAction::Append)
        .num_args(1..)
        .required(true)
        .value_parser(value_parser!(u32).range(1..))
}

fn build_cli() -> Command {
    let watch = Command::new("watch")
        .about("Poll the server and show live task status and logs until Ctrl-C")
        .arg(
            Arg::new("cache_db")
                .long("cache-db")
                .help("SQLite file holding the last known task list")
                .num_args(1),
        );

    let add = Command::new("add")
        .about("Add a transfer task")
        .arg(Arg::new("url").long("url").help("Share link").required(true).num_args(1))
        .arg(Arg::new("save_dir").long("save-dir").help("Target directory").required(true).num_args(1))
        .arg(Arg::new("pwd").long("pwd").help("Share password").num_args(1))
        .arg(Arg::new("name").long("name").help("Display name").num_args(1))
        .arg(Arg::new("cron").long("cron").help("Cron schedule").num_args(1))
        .arg(Arg::new("category").long("category").help("Category label").num_args(1));

    let move_cmd = Command::new("move")
        .about("Move a task to a new zero-based position")
        .arg(Arg::new("order").required(true).value_parser(value_parser!(u32).range(1..)))
        .arg(Arg::new("new_index").required(true).value_parser(value_parser!(u32)));

    Command::new("autosave-sync")
        .about("Live client for a cloud-drive auto-save task server")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(Arg::new("config").long("config").help("TOML config file").num_args(1).global(true))
        .arg(Arg::new("server").long("server").help("Server base URL").num_args(1).global(true))
        .arg(Arg::new("cookie").long("cookie").help("Session cookie header value").num_args(1).global(true))
        .arg(
            Arg::new("locale")
                .long("locale")
                .help("Output language (en, zh)")
                .default_value("en")
                .num_args(1)
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Debug logging")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(watch)
        .subcommand(Command::new("tasks").about("Print the current task list"))
        .subcommand(
            Command::new("execute")
                .about("Run tasks now; several orders run as one batch")
                .arg(orders_arg("Task orders (1-based)")),
        )
        .subcommand(add)
        .subcommand(Command::new("delete").about("Delete tasks").arg(orders_arg("Task orders (1-based)")))
        .subcommand(move_cmd)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "autosave_sync=debug" } else { "autosave_sync=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(m: &ArgMatches) -> anyhow::Result<SyncConfig> {
    let mut cfg = match m.get_one::<String>("config") {
        Some(p) => SyncConfig::load(Path::new(p))?,
        None => SyncConfig::default(),
    };
    if let Some(s) = m.get_one::<String>("server") {
        cfg.server.base_url = s.clone();
    }
    if let Some(c) = m.get_one::<String>("cookie") {
        cfg.server.cookie = Some(c.clone());
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();
    init_tracing(matches.get_flag("verbose"));

    let locale = matches
        .get_one::<String>("locale")
        .map(|s| Locale::from_str(s))
        .unwrap_or_default();
    let msgs = get_messages(locale);

    let cfg = load_config(&matches)?;
    let backend = Arc::new(HttpBackend::new(&cfg.server).context("build http backend")?);
    info!(server = %cfg.server.base_url, "using server");

    match matches.subcommand() {
        Some(("watch", m)) => {
            let engine = match m.get_one::<String>("cache_db") {
                Some(p) => {
                    let store = SqliteStore::open(&PathBuf::from(p)).await?;
                    SyncEngine::with_cache(backend, &cfg, store).await?
                }
                None => SyncEngine::new(backend, &cfg),
            };
            watch(&engine, msgs, false).await?;
            engine.dispose();
        }
        Some(("tasks", _)) => {
            let engine = SyncEngine::new(backend, &cfg);
            engine.refresh().await.context("fetch tasks")?;
            print_tasks(&engine.tasks(), msgs);
        }
        Some(("execute", m)) => {
            let orders: Vec<TaskOrder> = m.get_many::<u32>("orders").into_iter().flatten().copied().collect();
            let engine = SyncEngine::new(backend, &cfg);
            engine.refresh().await.context("fetch tasks")?;

            if let [order] = orders.as_slice() {
                let ack = engine.execute_task(*order).await?;
                println!("{}: {}", msgs.execute_accepted, ack.message.unwrap_or_default());
                for f in &ack.transferred_files {
                    println!("  {} {}", msgs.transferred, f);
                }
            } else {
                let results = engine.execute_batch(&orders).await?;
                print_batch(&results, msgs);
            }

            watch(&engine, msgs, true).await?;
            engine.dispose();
        }
        Some(("add", m)) => {
            let opt = |k: &str| m.get_one::<String>(k).cloned();
            let draft = TaskDraft {
                url: opt("url").unwrap_or_default(),
                save_dir: opt("save_dir").unwrap_or_default(),
                pwd: opt("pwd"),
                name: opt("name"),
                category: opt("category"),
                cron: opt("cron"),
                ..TaskDraft::default()
            };
            let engine = SyncEngine::new(backend, &cfg);
            engine.refresh().await.context("fetch tasks")?;
            let order = engine.add_task(draft).await?;
            println!("{}: #{}", msgs.task_added, order);
        }
        Some(("delete", m)) => {
            let orders: Vec<TaskOrder> = m.get_many::<u32>("orders").into_iter().flatten().copied().collect();
            let engine = SyncEngine::new(backend, &cfg);
            engine.refresh().await.context("fetch tasks")?;
            if let [order] = orders.as_slice() {
                engine.delete_task(*order).await?;
            } else {
                engine.delete_batch(&orders).await?;
            }
            println!("{}: {:?}", msgs.task_deleted, orders);
        }
        Some(("move", m)) => {
            let order = m.get_one::<u32>("order").copied().context("missing order")?;
            let new_index = m.get_one::<u32>("new_index").copied().context("missing new index")?;
            let engine = SyncEngine::new(backend, &cfg);
            engine.refresh().await.context("fetch tasks")?;
            engine.move_task(order, new_index).await?;
            println!("{}: #{} -> {}", msgs.task_moved, order, new_index);
        }
        _ => {}
    }

    Ok(())
}

/// Renders engine events: a bar per running task, one line per log entry,
/// transition and error.
struct Ui {
    mp: MultiProgress,
    style: ProgressStyle,
    msgs: &'static Messages,
    bars: HashMap<TaskOrder, ProgressBar>,
}

impl Ui {
    fn new(msgs: &'static Messages) -> anyhow::Result<Self> {
        let style = ProgressStyle::with_template("{spinner:.green} {prefix} {bar:30.cyan/blue} {pos:>3}% {wide_msg}")?
            .tick_chars("|/-\\ ");
        Ok(Self { mp: MultiProgress::new(), style, msgs, bars: HashMap::new() })
    }

    fn println(&self, line: String) {
        let _ = self.mp.println(line);
    }

    fn render_tasks(&mut self, tasks: &[Task]) {
        for t in tasks {
            if t.status == TaskStatus::Running {
                let pb = self.bars.entry(t.order).or_insert_with(|| {
                    let pb = self.mp.add(ProgressBar::new(100));
                    pb.set_style(self.style.clone());
                    pb.enable_steady_tick(std::time::Duration::from_millis(120));
                    pb
                });
                pb.set_prefix(format!("[#{} {}]", t.order, t.display_name()));
                pb.set_position(t.progress.unwrap_or(0).min(100) as u64);
                pb.set_message(t.message.clone().unwrap_or_default());
            } else if let Some(pb) = self.bars.remove(&t.order) {
                pb.finish_with_message(self.msgs.status(t.status).to_string());
            }
        }
        let live: Vec<TaskOrder> = self
            .bars
            .keys()
            .copied()
            .filter(|o| !tasks.iter().any(|t| t.order == *o))
            .collect();
        for o in live {
            if let Some(pb) = self.bars.remove(&o) {
                pb.finish_and_clear();
            }
        }
    }

    fn handle(&mut self, evt: &SyncEvent) {
        match evt {
            SyncEvent::Started => self.println(format!("[INFO] {}", self.msgs.polling_started)),
            SyncEvent::Stopped => self.println(format!("[INFO] {}", self.msgs.polling_stopped)),
            SyncEvent::TaskUpdate { tasks } => self.render_tasks(tasks),
            SyncEvent::LogsUpdate { logs } => {
                for l in logs {
                    self.println(format!("[{}] {} {} {}", self.msgs.log_prefix, l.timestamp, l.level, l.message));
                }
            }
            SyncEvent::TaskStatusChanged { order, from, to, message } => {
                self.println(format!(
                    "[#{}] {} -> {} {}",
                    order,
                    self.msgs.status(*from),
                    self.msgs.status(*to),
                    message.as_deref().unwrap_or("")
                ));
            }
            SyncEvent::Error { context, message } => {
                self.println(format!("[{}] {}: {}", self.msgs.error_prefix, context, message));
            }
        }
    }
}

async fn watch(engine: &SyncEngine, msgs: &'static Messages, until_idle: bool) -> anyhow::Result<()> {
    let mut rx = engine.subscribe();
    let mut ui = Ui::new(msgs)?;
    ui.render_tasks(&engine.tasks());
    if until_idle && !has_running(&engine.tasks()) {
        ui.println(msgs.all_idle.to_string());
        return Ok(());
    }

    engine.start();
    ui.println(msgs.watching_hint.to_string());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            evt = rx.recv() => match evt {
                Ok(evt) => {
                    ui.handle(&evt);
                    if until_idle {
                        if let SyncEvent::TaskUpdate { tasks } = &evt {
                            if !has_running(tasks) {
                                ui.println(msgs.all_idle.to_string());
                                break;
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "ui fell behind the event stream"),
                Err(RecvError::Closed) => break,
            },
            res = &mut ctrl_c => {
                res.context("listen for ctrl-c")?;
                break;
            }
        }
    }

    engine.stop();
    Ok(())
}

fn has_running(tasks: &[Task]) -> bool {
    tasks.iter().any(|t| t.status == TaskStatus::Running)
}

fn print_tasks(tasks: &[Task], msgs: &Messages) {
    if tasks.is_empty() {
        println!("{}", msgs.no_tasks);
        return;
    }
    for t in tasks {
        let progress = t.progress.map(|p| format!("{}%", p)).unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3}  {:<8} {:>4}  {}  {}",
            t.order,
            msgs.status(t.status),
            progress,
            t.display_name(),
            t.message.as_deref().unwrap_or("")
        );
    }
    let s = TaskStats::of(tasks);
    println!(
        "{}: {} | {} {} | {} {} | {} {} | {} {}",
        msgs.stats_header,
        s.total,
        msgs.status_normal,
        s.normal,
        msgs.status_running,
        s.running,
        msgs.status_success,
        s.success,
        msgs.status_error,
        s.error
    );
}

fn print_batch(results: &BatchResults, msgs: &Messages) {
    let orders = |v: &[BatchEntry]| v.iter().map(|e| e.order()).collect::<Vec<_>>();
    println!("{}: {}", msgs.batch_summary, results.message.as_deref().unwrap_or(""));
    println!("  {}: {:?}", msgs.status_success, orders(&results.success));
    println!("  {}: {:?}", msgs.status_normal, orders(&results.skipped));
    println!("  {}: {:?}", msgs.status_error, orders(&results.failed));
    for (url, files) in &results.transferred_files {
        println!("  {} {} <- {}", msgs.transferred, files.len(), url);
    }
}
