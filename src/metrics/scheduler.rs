use std::time::Duration;

use metrics::{counter, histogram};

pub fn log_read_cycle(device_count: u64) {
    counter!("dataplane_scheduler_read_cycles_total").increment(1);
    histogram!("dataplane_scheduler_read_devices_per_cycle").record(device_count as f64);
}

pub fn log_bulk_read_cycle(handler_count: u64) {
    counter!("dataplane_scheduler_bulk_read_cycles_total").increment(1);
    histogram!("dataplane_scheduler_bulk_read_handlers_per_cycle").record(handler_count as f64);
}

pub fn log_read_error(unsupported: bool) {
    let label = if unsupported { "unsupported" } else { "io" };
    counter!("dataplane_scheduler_read_errors_total", "kind" => label).increment(1);
}

pub fn log_transform_dropped() {
    counter!("dataplane_scheduler_transform_dropped_total").increment(1);
}

pub fn log_write_batch(size: u64) {
    counter!("dataplane_scheduler_write_batches_total").increment(1);
    histogram!("dataplane_scheduler_write_batch_size").record(size as f64);
}

pub fn log_write_outcome(outcome: &'static str, elapsed: Duration) {
    counter!("dataplane_scheduler_write_outcomes_total", "outcome" => outcome).increment(1);
    histogram!("dataplane_scheduler_write_seconds", "outcome" => outcome).record(elapsed.as_secs_f64());
}

pub fn log_listener_restart(handler: &str, device_id: &str) {
    counter!(
        "dataplane_scheduler_listener_restarts_total",
        "handler" => handler.to_owned(),
        "device_id" => device_id.to_owned()
    )
    .increment(1);
}
