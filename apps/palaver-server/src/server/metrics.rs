use std::{collections::HashMap, fmt::Write as _};

use super::core::{MetricsState, METRICS_STATE};

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

pub(crate) fn render_metrics() -> String {
    let auth_failures = metrics_state()
        .auth_failures
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let rate_limit_hits = metrics_state()
        .rate_limit_hits
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let notify_failures = metrics_state()
        .notify_failures
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());

    let mut output = String::new();
    output.push_str("# HELP palaver_auth_failures_total Count of auth-related failures by reason\n");
    output.push_str("# TYPE palaver_auth_failures_total counter\n");
    let mut auth_entries: Vec<_> = auth_failures.into_iter().collect();
    auth_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in auth_entries {
        let _ = writeln!(
            output,
            "palaver_auth_failures_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP palaver_rate_limit_hits_total Count of rate-limit rejections by surface\n",
    );
    output.push_str("# TYPE palaver_rate_limit_hits_total counter\n");
    let mut rate_entries: Vec<_> = rate_limit_hits.into_iter().collect();
    rate_entries.sort_by_key(|((surface, reason), _)| (*surface, *reason));
    for ((surface, reason), value) in rate_entries {
        let _ = writeln!(
            output,
            "palaver_rate_limit_hits_total{{surface=\"{surface}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP palaver_notify_failures_total Count of swallowed notification forwarder failures by reason\n",
    );
    output.push_str("# TYPE palaver_notify_failures_total counter\n");
    let mut notify_entries: Vec<_> = notify_failures.into_iter().collect();
    notify_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in notify_entries {
        let _ = writeln!(
            output,
            "palaver_notify_failures_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().auth_failures.lock() {
        let entry = counters.entry(reason).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_rate_limit_hit(surface: &'static str, reason: &'static str) {
    if let Ok(mut counters) = metrics_state().rate_limit_hits.lock() {
        let entry = counters.entry((surface, reason)).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_notify_failure(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().notify_failures.lock() {
        let entry = counters.entry(reason).or_insert(0);
        *entry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{metrics_state, record_notify_failure, render_metrics};

    #[test]
    fn notify_failures_render_with_reason_label() {
        record_notify_failure("transport");

        let counters = metrics_state()
            .notify_failures
            .lock()
            .expect("notify metrics mutex should not be poisoned");
        assert!(counters.get("transport").copied().unwrap_or(0) >= 1);
        drop(counters);

        let rendered = render_metrics();
        assert!(rendered.contains("palaver_notify_failures_total{reason=\"transport\"}"));
    }
}
