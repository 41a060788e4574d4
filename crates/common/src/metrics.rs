use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_in: CounterVec,
    operator_rows_out: CounterVec,
    operator_batches_in: CounterVec,
    operator_batches_out: CounterVec,
    operator_time_seconds: HistogramVec,
    exchange_frames_sent: CounterVec,
    exchange_bytes_sent: CounterVec,
    exchange_frames_received: CounterVec,
    exchange_duplicates_dropped: CounterVec,
    exchange_backpressure_waits: CounterVec,
    exchange_send_retries: CounterVec,
    scheduler_queued_tasks: GaugeVec,
    scheduler_running_tasks: GaugeVec,
    scheduler_retries: CounterVec,
    pool_bytes_in_use: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_operator(
        &self,
        query_id: &str,
        stage_id: u64,
        task_id: u64,
        operator: &str,
        rows_in: u64,
        rows_out: u64,
        batches_in: u64,
        batches_out: u64,
        secs: f64,
    ) {
        let labels = [
            query_id,
            &stage_id.to_string(),
            &task_id.to_string(),
            operator,
        ];
        self.inner
            .operator_rows_in
            .with_label_values(&labels)
            .inc_by(rows_in as f64);
        self.inner
            .operator_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .operator_batches_in
            .with_label_values(&labels)
            .inc_by(batches_in as f64);
        self.inner
            .operator_batches_out
            .with_label_values(&labels)
            .inc_by(batches_out as f64);
        self.inner
            .operator_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn record_exchange_send(&self, query_id: &str, stage_id: u64, bytes: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .exchange_frames_sent
            .with_label_values(&labels)
            .inc();
        self.inner
            .exchange_bytes_sent
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    pub fn record_exchange_receive(&self, query_id: &str, stage_id: u64, duplicate: bool) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .exchange_frames_received
            .with_label_values(&labels)
            .inc();
        if duplicate {
            self.inner
                .exchange_duplicates_dropped
                .with_label_values(&labels)
                .inc();
        }
    }

    pub fn inc_exchange_backpressure_waits(&self, destination: &str) {
        self.inner
            .exchange_backpressure_waits
            .with_label_values(&[destination])
            .inc();
    }

    pub fn inc_exchange_send_retries(&self, destination: &str) {
        self.inner
            .exchange_send_retries
            .with_label_values(&[destination])
            .inc();
    }

    pub fn set_scheduler_queued_tasks(&self, query_id: &str, stage_id: u64, queued: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .scheduler_queued_tasks
            .with_label_values(&labels)
            .set(queued as f64);
    }

    pub fn set_scheduler_running_tasks(&self, query_id: &str, stage_id: u64, running: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .scheduler_running_tasks
            .with_label_values(&labels)
            .set(running as f64);
    }

    pub fn inc_scheduler_retries(&self, query_id: &str, stage_id: u64) {
        let labels = [query_id, &stage_id.to_string()];
        self.inner
            .scheduler_retries
            .with_label_values(&labels)
            .inc();
    }

    pub fn set_pool_bytes_in_use(&self, bytes: usize) {
        self.inner.pool_bytes_in_use.set(bytes as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const OPERATOR_LABELS: &[&str] = &["query_id", "stage_id", "task_id", "operator"];
const STAGE_LABELS: &[&str] = &["query_id", "stage_id"];
const DESTINATION_LABELS: &[&str] = &["destination"];

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_rows_in = counter_vec(
            &registry,
            "quarry_operator_rows_in_total",
            "Input rows processed per operator",
            OPERATOR_LABELS,
        );
        let operator_rows_out = counter_vec(
            &registry,
            "quarry_operator_rows_out_total",
            "Output rows produced per operator",
            OPERATOR_LABELS,
        );
        let operator_batches_in = counter_vec(
            &registry,
            "quarry_operator_batches_in_total",
            "Input batches processed per operator",
            OPERATOR_LABELS,
        );
        let operator_batches_out = counter_vec(
            &registry,
            "quarry_operator_batches_out_total",
            "Output batches produced per operator",
            OPERATOR_LABELS,
        );
        let operator_time_seconds = histogram_vec(
            &registry,
            "quarry_operator_time_seconds",
            "Time spent in each operator",
            OPERATOR_LABELS,
        );

        let exchange_frames_sent = counter_vec(
            &registry,
            "quarry_exchange_frames_sent_total",
            "Exchange frames delivered to a destination worker",
            STAGE_LABELS,
        );
        let exchange_bytes_sent = counter_vec(
            &registry,
            "quarry_exchange_bytes_sent_total",
            "Exchange payload bytes delivered",
            STAGE_LABELS,
        );
        let exchange_frames_received = counter_vec(
            &registry,
            "quarry_exchange_frames_received_total",
            "Exchange frames accepted by a receiving spool",
            STAGE_LABELS,
        );
        let exchange_duplicates_dropped = counter_vec(
            &registry,
            "quarry_exchange_duplicates_dropped_total",
            "Exchange frames dropped as already-seen sequence numbers",
            STAGE_LABELS,
        );
        let exchange_backpressure_waits = counter_vec(
            &registry,
            "quarry_exchange_backpressure_waits_total",
            "Sends that waited for in-flight capacity",
            DESTINATION_LABELS,
        );
        let exchange_send_retries = counter_vec(
            &registry,
            "quarry_exchange_send_retries_total",
            "Exchange sends retried after a delivery failure",
            DESTINATION_LABELS,
        );

        let scheduler_queued_tasks = gauge_vec(
            &registry,
            "quarry_scheduler_queued_tasks",
            "Currently queued tasks",
            STAGE_LABELS,
        );
        let scheduler_running_tasks = gauge_vec(
            &registry,
            "quarry_scheduler_running_tasks",
            "Currently running tasks",
            STAGE_LABELS,
        );
        let scheduler_retries = counter_vec(
            &registry,
            "quarry_scheduler_retries_total",
            "Task retries",
            STAGE_LABELS,
        );

        let pool_bytes_in_use = Gauge::with_opts(Opts::new(
            "quarry_buffer_pool_bytes_in_use",
            "Bytes reserved in the buffer pool",
        ))
        .expect("gauge");
        registry
            .register(Box::new(pool_bytes_in_use.clone()))
            .expect("register gauge");

        Self {
            registry,
            operator_rows_in,
            operator_rows_out,
            operator_batches_in,
            operator_batches_out,
            operator_time_seconds,
            exchange_frames_sent,
            exchange_bytes_sent,
            exchange_frames_received,
            exchange_duplicates_dropped,
            exchange_backpressure_waits,
            exchange_send_retries,
            scheduler_queued_tasks,
            scheduler_running_tasks,
            scheduler_retries,
            pool_bytes_in_use,
        }
    }
}

// Metric names and label sets are static, so construction cannot fail at runtime.
fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
