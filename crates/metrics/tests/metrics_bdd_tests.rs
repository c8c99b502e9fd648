//! BDD Tests for check results and reports

use std::time::Duration;

use chrono::{TimeZone, Utc};
use cucumber::{given, then, when, World};
use metrics::{CheckReport, CheckResult, CheckStatus};

#[derive(Debug, World)]
#[world(init = Self::new)]
struct MetricsWorld {
    result: Option<CheckResult>,
    report: Option<CheckReport>,
}

impl MetricsWorld {
    fn new() -> Self {
        Self {
            result: None,
            report: None,
        }
    }

    fn result(&mut self) -> &mut CheckResult {
        self.result.as_mut().expect("a result was created")
    }
}

#[given(expr = "a result for {string} started at {int}")]
async fn given_result(world: &mut MetricsWorld, short_name: String, started: i64) {
    let at = Utc.timestamp_opt(started, 0).unwrap();
    world.result = Some(CheckResult::started_at(short_name, at));
}

#[when(expr = "the plugin adds {string}")]
async fn when_adds(world: &mut MetricsWorld, line: String) {
    world.result().add(line);
}

#[when(expr = "the plugin adds {string} at {int}")]
async fn when_adds_at(world: &mut MetricsWorld, line: String, timestamp: i64) {
    world.result().add_with_time(line, timestamp);
}

#[when(expr = "the result is reported for client {string} as check {string}")]
async fn when_reported(world: &mut MetricsWorld, client: String, check: String) {
    let result = world.result().clone();
    world.report = Some(CheckReport::from_result(
        client,
        check,
        result.start_time(),
        &result,
        Duration::from_millis(40),
    ));
}

#[when(expr = "the check is reported as timed out for client {string}")]
async fn when_timed_out(world: &mut MetricsWorld, client: String) {
    let started = world.result().start_time();
    world.report = Some(CheckReport::failed(
        client,
        "tcp",
        started,
        started,
        Duration::from_secs(10),
        "deadline of 10s exceeded",
        CheckStatus::Unknown,
    ));
}

#[then(expr = "the result has the line {string}")]
async fn then_has_line(world: &mut MetricsWorld, line: String) {
    assert!(world.result().lines().contains(&line));
}

#[then(expr = "the report status is {int}")]
async fn then_status(world: &mut MetricsWorld, status: u8) {
    let report = world.report.as_ref().expect("a report");
    assert_eq!(report.check.status.code(), status);
}

#[then(expr = "the report output is {string}")]
async fn then_output(world: &mut MetricsWorld, output: String) {
    let report = world.report.as_ref().expect("a report");
    assert_eq!(report.check.output, output);
}

#[tokio::main]
async fn main() {
    MetricsWorld::cucumber().run_and_exit("tests/features").await;
}
