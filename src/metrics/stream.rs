use metrics::{counter, gauge};

pub fn log_stream_opened() {
    counter!("dataplane_stream_opened_total").increment(1);
    gauge!("dataplane_stream_active").increment(1.0);
}

pub fn log_stream_closed() {
    gauge!("dataplane_stream_active").decrement(1.0);
}

pub fn log_reading_forwarded() {
    counter!("dataplane_stream_readings_forwarded_total").increment(1);
}

pub fn log_reading_filtered_out() {
    counter!("dataplane_stream_readings_filtered_total").increment(1);
}

pub fn log_reading_dropped_full() {
    counter!("dataplane_stream_readings_dropped_total").increment(1);
}
