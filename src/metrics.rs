use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use itertools::Itertools;
use opentelemetry::{global, metrics::Counter, KeyValue};
use prometheus::{IntGaugeVec, Opts};

use crate::kubernetes::revision_tag::ConditionReason;

pub struct Metrics {
    pub reconciliations: Counter<u64>,
    pub reconcile_errors: Counter<u64>,
    pub chart_operations: Counter<u64>,
    pub status_patches: Counter<u64>,
    pub tags_by_state: IntGaugeVec,
    tag_states: Mutex<BTreeMap<String, ConditionReason>>,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn init(registry: &prometheus::Registry) -> Result<(), anyhow::Error> {
    let meter = global::meter("revtag");

    let tags_by_state = IntGaugeVec::new(
        Opts::new("revtag_tags_by_state", "Number of RevisionTags in each state"),
        &["state"],
    )?;
    registry.register(Box::new(tags_by_state.clone()))?;

    let metrics = Metrics {
        reconciliations: meter.u64_counter("revtag_reconciliations_total").init(),
        reconcile_errors: meter.u64_counter("revtag_reconcile_errors_total").init(),
        chart_operations: meter.u64_counter("revtag_chart_operations_total").init(),
        status_patches: meter.u64_counter("revtag_status_patches_total").init(),
        tags_by_state,
        tag_states: Mutex::new(BTreeMap::new()),
    };

    METRICS
        .set(metrics)
        .map_err(|_| anyhow::anyhow!("Metrics already initialized"))?;

    Ok(())
}

/// `None` until `init` has run, e.g. in unit tests
pub fn get() -> Option<&'static Metrics> {
    METRICS.get()
}

pub fn record_reconciliation() {
    if let Some(m) = get() {
        m.reconciliations.add(1, &[]);
    }
}

pub fn record_reconcile_error(reason: ConditionReason) {
    if let Some(m) = get() {
        m.reconcile_errors
            .add(1, &[KeyValue::new("reason", reason.as_str())]);
    }
}

pub fn record_chart_operation(operation: &'static str) {
    if let Some(m) = get() {
        m.chart_operations
            .add(1, &[KeyValue::new("operation", operation)]);
    }
}

pub fn record_status_patch() {
    if let Some(m) = get() {
        m.status_patches.add(1, &[]);
    }
}

/// Tracks the state of one tag; `None` forgets a deleted tag
pub fn record_tag_state(tag: &str, state: Option<ConditionReason>) {
    let Some(m) = get() else {
        return;
    };
    let mut states = m.tag_states.lock().unwrap_or_else(PoisonError::into_inner);
    match state {
        Some(state) => {
            states.insert(tag.to_string(), state);
        }
        None => {
            states.remove(tag);
        }
    }
    let counts = states.values().counts();
    for reason in ConditionReason::ALL {
        let count = counts.get(&reason).copied().unwrap_or(0);
        m.tags_by_state
            .with_label_values(&[reason.as_str()])
            .set(count as i64);
    }
}
