use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use broote::adapter::Callable;
use broote::behavior::AsyncCheck;
use broote::{
    AsyncBehavior, Behavior, Field, MultiRunner, Record, Run, RunSettings, Runner, Table,
};

#[derive(Parser)]
#[command(name = "broote-demo")]
#[command(about = "Runs a brute-force table against an in-process login form")]
struct Cli {
    /// Execution model of a single runner
    #[arg(long, value_enum, default_value_t = Mode::Basic)]
    mode: Mode,

    /// Run one runner per model together under this schedule
    #[arg(long, value_enum)]
    multi: Option<MultiMode>,

    /// Directory holding broote.json
    #[arg(long, default_value = ".")]
    config: PathBuf,

    /// Worker budget, overriding the configured one
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Basic,
    Thread,
    Async,
}

#[derive(Clone, Copy, ValueEnum)]
enum MultiMode {
    Sequential,
    Thread,
    Async,
}

/// Reply of the fake login form
struct Reply {
    status: u16,
}

/// Accepts only Ben with password 1
fn login(form: &str, record: &Record) -> anyhow::Result<Reply> {
    let username = record
        .get("username")
        .and_then(Value::as_str)
        .context("record has no username")?;
    let password = record
        .get("password")
        .and_then(Value::as_i64)
        .context("record has no password")?;
    tracing::trace!(form, username, password, "login");
    let status = if username == "Ben" && password == 1 { 200 } else { 401 };
    Ok(Reply { status })
}

fn table() -> Table {
    Table::new()
        .with_primary_field(Field::new("username", ["Ben", "John", "Marry"]))
        .with_field(Field::new("password", 0..10))
}

fn runner(mode: Mode, settings: &RunSettings) -> broote::Result<Runner<String, Reply>> {
    let form = String::from("/login");
    match mode {
        Mode::Basic | Mode::Thread => {
            let behavior = Behavior::new(|form: &String, record: &Record, _: Option<&()>| {
                login(form, record)
            })
            .success(|reply: &Reply| reply.status == 200)
            .target_reached(|reply: &Reply| reply.status < 500);
            if matches!(mode, Mode::Basic) {
                Runner::basic(form, table(), behavior, settings)
            } else {
                Runner::thread(form, table(), behavior, settings)
            }
        }
        Mode::Async => {
            let behavior = AsyncBehavior::new(Callable::awaitable(
                |(form, record, _): (Arc<String>, Record, Option<Arc<()>>)| async move {
                    login(&form, &record)
                },
            ))
            .success_value(200)
            .compare_func(Callable::blocking(
                |(check, reply): (AsyncCheck<Reply>, Arc<Reply>)| {
                    check.as_value().and_then(Value::as_u64) == Some(u64::from(reply.status))
                },
            ));
            Runner::asynchronous(form, table(), behavior, settings)
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("broote=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = RunSettings::load(&cli.config)?;
    if let Some(workers) = cli.workers {
        settings.max_workers = Some(workers);
    }

    let records = match cli.multi {
        None => {
            let runner = runner(cli.mode, &settings)?;
            runner.start()?;
            tracing::info!(
                elapsed_ms = runner.get_runner_time().as_millis() as u64,
                completed = runner.completed(),
                "runner finished"
            );
            runner.get_success_records()
        }
        Some(schedule) => {
            let runners: Vec<Arc<dyn Run>> = [Mode::Basic, Mode::Thread, Mode::Async]
                .into_iter()
                .map(|mode| runner(mode, &settings).map(|r| Arc::new(r) as Arc<dyn Run>))
                .collect::<broote::Result<_>>()?;
            let multi = match schedule {
                MultiMode::Sequential => MultiRunner::sequential(runners),
                MultiMode::Thread => MultiRunner::thread(runners),
                MultiMode::Async => MultiRunner::asynchronous(runners),
            };
            multi.start()?;
            multi.get_success_records()
        }
    };

    let records: Vec<Value> = records.into_iter().map(Value::Object).collect();
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
