use metrics::{counter, gauge};

pub fn log_reading_ingested() {
    counter!("dataplane_state_readings_ingested_total").increment(1);
}

pub fn set_current_readings_devices(count: u64) {
    gauge!("dataplane_state_current_readings_devices").set(count as f64);
}

pub fn set_read_queue_depth(used: u64, capacity: u64) {
    gauge!("dataplane_state_read_queue_depth").set(used as f64);
    gauge!("dataplane_state_read_queue_capacity").set(capacity as f64);
}

pub fn log_duplicate_transaction() {
    counter!("dataplane_state_duplicate_transactions_total").increment(1);
}

pub fn log_bad_timestamp() {
    counter!("dataplane_state_bad_cache_timestamps_total").increment(1);
}
