/*!
Definitions of the metrics emitted by the server. Exporter wiring is the
embedder's business; these are plain `metrics` facade names.
*/

// Gauge, apps currently loaded (draining included).
pub(crate) static METRIC_ACTIVE_APPS: &str = "active_apps";

// Counters, lifetime totals.
pub(crate) static METRIC_APP_LOADS: &str = "app_loads_total";
pub(crate) static METRIC_APP_UNLOADS: &str = "app_unloads_total";
pub(crate) static METRIC_REQUESTS: &str = "requests_total";
pub(crate) static METRIC_WATCHDOG_TERMINATIONS: &str = "watchdog_terminations_total";
