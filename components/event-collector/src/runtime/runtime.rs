//! Run drivers.
//!
//! `run_once` performs a single collection cycle; `run_watch` repeats cycles on
//! a fixed interval until interrupted. Both open the output sink before any
//! gateway traffic, so a bad output path fails the run without connecting.

// Local crates
use crate::{
    collector::{
        cycle::{CycleError, CycleOutput, run_cycle},
        filter::{FilterError, build_filter},
    },
    gateway::gateway::SessionGateway,
    helpers::{load_config::Settings, shutdown::Shutdown},
    metrics::{
        http::start_metrics_server,
        metrics::{CYCLES_FAILED_TOTAL, CYCLES_TOTAL},
    },
    sink::sink::{EventSink, SinkError, SinkReport},
};

// External crates
use chrono::{DateTime, TimeDelta, Utc};
use tracing::instrument;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Interrupted,
}

/// Chooses the lookback of each watch cycle.
///
/// After a successful cycle the next window starts where that one ended, so a
/// late cycle widens its window instead of leaving a gap. Before the first
/// success, or if the clock went backwards, the configured lookback is used.
#[derive(Debug, Clone)]
pub struct WindowPlanner {
    lookback: TimeDelta,
    last_end: Option<DateTime<Utc>>,
}

impl WindowPlanner {
    pub fn new(lookback: TimeDelta) -> Self {
        Self {
            lookback,
            last_end: None,
        }
    }

    pub fn lookback_at(&self, now: DateTime<Utc>) -> TimeDelta {
        match self.last_end {
            Some(end) if now > end => now - end,
            _ => self.lookback,
        }
    }

    pub fn record_success(&mut self, end_time: DateTime<Utc>) {
        self.last_end = Some(end_time);
    }
}

/// Print a run milestone and mirror it to the operational log.
fn milestone(message: &str) {
    println!("{message}");
    tracing::info!("{message}");
}

/// Filter and cycle for one window. Nothing is written, so dropping this
/// future on interrupt leaves no trace in the output file.
#[instrument(
    name = "event_collector_runtime::fetch_window",
    target = "runtime::runtime",
    skip_all,
    level = "debug"
)]
async fn fetch_window<G>(
    gateway: &G,
    settings: &Settings,
    lookback: TimeDelta,
) -> Result<CycleOutput, RunError>
where
    G: SessionGateway,
{
    let filter = build_filter(Utc::now(), lookback, &settings.event_types())?;

    CYCLES_TOTAL.inc();
    let output = match run_cycle(
        gateway,
        filter,
        &settings.collection_options(),
        &settings.retry_policy(),
    )
    .await
    {
        Ok(output) => output,
        Err(e) => {
            CYCLES_FAILED_TOTAL.inc();
            return Err(e.into());
        }
    };

    milestone(&format!(
        "Got {} events in the given time range ({} to {})",
        output.events.len(),
        output.filter.begin_time.to_rfc3339(),
        output.filter.end_time.to_rfc3339()
    ));
    Ok(output)
}

/// Write a fetched window. Not raced against shutdown: once started, the whole
/// batch is written and flushed.
async fn persist_window(sink: &mut EventSink, output: &CycleOutput) -> Result<SinkReport, RunError> {
    let report = sink.write_events(&output.events).await?;
    if report.skipped > 0 {
        milestone(&format!(
            "Skipped {} events that could not be serialized",
            report.skipped
        ));
    }
    tracing::info!(
        written = report.written,
        skipped = report.skipped,
        "Window persisted"
    );
    Ok(report)
}

/// Collect a single window of `settings.lookback()` ending now.
///
/// An interrupt before the window is fetched ends the run with nothing
/// written. An interrupt during the write lets the write finish.
#[instrument(
    name = "event_collector_runtime::run_once",
    target = "runtime::runtime",
    skip_all,
    fields(host = %settings.vcenter.host),
    level = "info"
)]
pub async fn run_once<G>(
    gateway: &G,
    settings: &Settings,
    shutdown: &Shutdown,
) -> Result<Outcome, RunError>
where
    G: SessionGateway,
{
    let result = collect_once(gateway, settings, shutdown).await;
    milestone("Exiting.");
    result
}

async fn collect_once<G>(
    gateway: &G,
    settings: &Settings,
    shutdown: &Shutdown,
) -> Result<Outcome, RunError>
where
    G: SessionGateway,
{
    milestone(&format!("Starting event collection from {}", settings.vcenter.host));

    let mut sink = EventSink::open(
        &settings.sink.path,
        settings.sink.mode,
        settings.sink.echo_to_console,
    )
    .await?;

    let fetched = tokio::select! {
        biased;
        _ = shutdown.wait_for_shutdown() => None,
        result = fetch_window(gateway, settings, settings.lookback()) => Some(result?),
    };

    match fetched {
        Some(output) => {
            persist_window(&mut sink, &output).await?;
            Ok(Outcome::Completed)
        }
        None => Ok(Outcome::Interrupted),
    }
}

/// Collect windows every `settings.interval()` until shutdown.
///
/// A failed cycle is logged and the next one runs on schedule. Filter and
/// sink failures end the run.
#[instrument(
    name = "event_collector_runtime::run_watch",
    target = "runtime::runtime",
    skip_all,
    fields(host = %settings.vcenter.host),
    level = "info"
)]
pub async fn run_watch<G>(
    gateway: &G,
    settings: &Settings,
    shutdown: &Shutdown,
) -> Result<Outcome, RunError>
where
    G: SessionGateway,
{
    let result = watch_loop(gateway, settings, shutdown).await;
    milestone("Exiting.");
    result
}

async fn watch_loop<G>(
    gateway: &G,
    settings: &Settings,
    shutdown: &Shutdown,
) -> Result<Outcome, RunError>
where
    G: SessionGateway,
{
    milestone(&format!(
        "Starting event collection from {} every {} minutes",
        settings.vcenter.host, settings.collection.interval_minutes
    ));

    let mut sink = EventSink::open(
        &settings.sink.path,
        settings.sink.mode,
        settings.sink.echo_to_console,
    )
    .await?;

    if let Some(addr) = settings.metrics.listen_addr {
        let cancel = shutdown.child();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(addr, cancel).await {
                tracing::error!(error = %e, "Metrics server stopped");
            }
        });
    }

    let interval = settings.interval();
    let mut planner = WindowPlanner::new(settings.lookback());

    loop {
        let lookback = planner.lookback_at(Utc::now());

        let fetched = tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => break,
            result = fetch_window(gateway, settings, lookback) => result,
        };

        match fetched {
            Ok(output) => {
                persist_window(&mut sink, &output).await?;
                planner.record_success(output.filter.end_time);
            }
            Err(RunError::Cycle(e)) => {
                tracing::error!(error = %e, "Collection cycle failed, nothing persisted");
                println!("ERROR: {e}");
            }
            Err(e) => return Err(e),
        }

        tracing::debug!(sleep_duration = ?interval, "Waiting for next cycle");
        tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    Ok(Outcome::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::{
            gateway::GatewayError,
            testing::{Page, ScriptedGateway},
        },
        instrumentation::testing::CaptureLayer,
        models::event::Event,
    };
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.vcenter.host = "vc.lab".into();
        settings.sink.path = dir.path().join("events.log");
        settings.sink.echo_to_console = false;
        settings.retry.initial_delay_ms = 10;
        settings.collection.interval_minutes = 1;
        settings
    }

    fn event(minute: u32) -> Event {
        Event::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            format!("event at minute {minute}"),
        )
    }

    #[tokio::test]
    async fn missing_output_directory_fails_before_any_gateway_call() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.sink.path = dir.path().join("nope").join("events.log");
        let gateway = ScriptedGateway::new(vec![Page::Events(vec![event(1)])]);

        let result = run_once(&gateway, &settings, &Shutdown::new()).await;

        assert!(matches!(
            result,
            Err(RunError::Sink(SinkError::MissingDirectory(_)))
        ));
        assert_eq!(gateway.ledger().lock().unwrap().acquire_attempts, 0);
    }

    #[tokio::test]
    async fn run_once_persists_events_in_order() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let gateway = ScriptedGateway::new(vec![Page::Events(vec![event(5), event(2)])]);

        let outcome = run_once(&gateway, &settings, &Shutdown::new()).await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        let written = std::fs::read_to_string(&settings.sink.path).unwrap();
        let messages: Vec<String> = written
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["vmware"]["event"].as_str().unwrap().to_owned()
            })
            .collect();
        assert_eq!(messages, vec!["event at minute 2", "event at minute 5"]);

        let ledger = gateway.ledger();
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.closes, 1);
        let filter = &ledger.filters[0];
        assert_eq!(filter.end_time - filter.begin_time, TimeDelta::minutes(60));
    }

    #[tokio::test]
    async fn run_once_reports_cycle_failures() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let gateway = ScriptedGateway::new(vec![Page::Fail(GatewayError::InvalidResponse(
            "truncated".into(),
        ))]);

        let result = run_once(&gateway, &settings, &Shutdown::new()).await;

        assert!(matches!(result, Err(RunError::Cycle(CycleError::Collect(_)))));
        assert_eq!(std::fs::read_to_string(&settings.sink.path).unwrap(), "");
    }

    #[tokio::test]
    async fn interrupted_run_once_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let gateway = ScriptedGateway::new(vec![]);
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let outcome = run_once(&gateway, &settings, &shutdown).await.unwrap();

        assert_eq!(outcome, Outcome::Interrupted);
        assert_eq!(gateway.ledger().lock().unwrap().acquire_attempts, 0);
        assert_eq!(std::fs::read_to_string(&settings.sink.path).unwrap(), "");
    }

    #[tokio::test]
    async fn interrupt_during_write_still_persists_the_whole_window() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let padding = "x".repeat(2048);
        let pages = (0..3)
            .map(|page| {
                Page::Events(
                    (0..1000)
                        .map(|i| {
                            let n = page * 1000 + i;
                            Event::new(start + TimeDelta::seconds(n), format!("{n} {padding}"))
                        })
                        .collect(),
                )
            })
            .collect();
        let gateway = ScriptedGateway::new(pages);
        let shutdown = Shutdown::new();

        let watcher = {
            let shutdown = shutdown.clone();
            let path = settings.sink.path.clone();
            tokio::spawn(async move {
                loop {
                    let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    if len > 0 {
                        shutdown.trigger();
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let outcome = run_once(&gateway, &settings, &shutdown).await.unwrap();
        watcher.await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert!(shutdown.is_triggered());
        let written = std::fs::read_to_string(&settings.sink.path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3000);
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[tokio::test]
    async fn milestones_reach_the_operational_log_on_failure() {
        let (capture, _guard) = CaptureLayer::install();
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir);
        settings.sink.path = dir.path().join("nope").join("events.log");
        let gateway = ScriptedGateway::new(vec![]);

        assert!(run_once(&gateway, &settings, &Shutdown::new()).await.is_err());

        let messages = capture.messages();
        assert!(messages.contains(&"Starting event collection from vc.lab".to_string()));
        assert_eq!(messages.last().map(String::as_str), Some("Exiting."));
    }

    #[tokio::test]
    async fn milestones_reach_the_operational_log_on_success() {
        let (capture, _guard) = CaptureLayer::install();
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let gateway = ScriptedGateway::new(vec![Page::Events(vec![event(3)])]);

        run_once(&gateway, &settings, &Shutdown::new()).await.unwrap();

        let messages = capture.messages();
        let position = |needle: &str| messages.iter().position(|m| m.starts_with(needle));
        let starting = position("Starting event collection").unwrap();
        let connected = position("Connected").unwrap();
        let counted = position("Got 1 events in the given time range").unwrap();
        let exiting = position("Exiting.").unwrap();
        assert!(starting < connected && connected < counted && counted < exiting);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_keeps_polling_after_failed_cycles() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let gateway = ScriptedGateway::new(vec![Page::Fail(GatewayError::Fault {
            fault: "SystemError".into(),
            message: "collector gone".into(),
        })]);
        let shutdown = Shutdown::new();

        let stop = async {
            tokio::time::sleep(Duration::from_secs(150)).await;
            shutdown.trigger();
        };
        let (outcome, ()) = tokio::join!(run_watch(&gateway, &settings, &shutdown), stop);

        assert_eq!(outcome.unwrap(), Outcome::Interrupted);
        let ledger = gateway.ledger();
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.acquire_attempts, 3);
        assert_eq!(ledger.closes, 3);
    }

    #[test]
    fn planner_uses_configured_lookback_until_a_cycle_succeeds() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut planner = WindowPlanner::new(TimeDelta::minutes(15));

        assert_eq!(planner.lookback_at(now), TimeDelta::minutes(15));

        planner.record_success(now);
        let late = now + TimeDelta::minutes(22);
        assert_eq!(planner.lookback_at(late), TimeDelta::minutes(22));
    }

    #[test]
    fn planner_falls_back_when_clock_goes_backwards() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut planner = WindowPlanner::new(TimeDelta::minutes(15));
        planner.record_success(now);

        assert_eq!(
            planner.lookback_at(now - TimeDelta::minutes(1)),
            TimeDelta::minutes(15)
        );
        assert_eq!(planner.lookback_at(now), TimeDelta::minutes(15));
    }
}
