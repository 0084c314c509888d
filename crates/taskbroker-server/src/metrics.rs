//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use crate::broker::Broker;
use crate::state::BrokerStats;

/// Collect all metrics from the broker and format as Prometheus text.
pub async fn collect_metrics(broker: &Broker) -> String {
    let stats = broker.stats().await;
    let mut output = String::new();

    write_runner_metrics(&stats, &mut output);
    write_task_metrics(&stats, &mut output);

    output
}

fn write_runner_metrics(stats: &BrokerStats, output: &mut String) {
    writeln!(
        output,
        "# HELP taskbroker_runners_connected Number of registered runners"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_runners_connected gauge").ok();
    writeln!(output, "taskbroker_runners_connected {}", stats.runners).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskbroker_runner_slots Runner task slots by state"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_runner_slots gauge").ok();
    writeln!(
        output,
        "taskbroker_runner_slots{{state=\"used\"}} {}",
        stats.slots_used
    )
    .ok();
    writeln!(
        output,
        "taskbroker_runner_slots{{state=\"free\"}} {}",
        stats.slots_total.saturating_sub(stats.slots_used)
    )
    .ok();
}

fn write_task_metrics(stats: &BrokerStats, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskbroker_tasks Tasks currently known to the broker by status"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_tasks gauge").ok();
    for (status, count) in &stats.tasks_by_status {
        writeln!(output, "taskbroker_tasks{{status=\"{status}\"}} {count}").ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskbroker_deferred_queue_length Tasks waiting for runner capacity"
    )
    .ok();
    writeln!(output, "# TYPE taskbroker_deferred_queue_length gauge").ok();
    writeln!(output, "taskbroker_deferred_queue_length {}", stats.deferred).ok();
}
