//! A tenant: one loaded app, its execution sandbox, and its drain state.

use std::time::{Duration, Instant};

use nano_runtime::{AppRuntime, HttpRequest, HttpResponse, LoopHandle};
use tracing::{instrument, Level};

use crate::config::TenantRecord;
use crate::metrics::{
    METRIC_ACTIVE_APPS, METRIC_APP_LOADS, METRIC_APP_UNLOADS, METRIC_REQUESTS,
    METRIC_WATCHDOG_TERMINATIONS,
};

pub const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantState {
    Active,
    Draining,
    Stopped,
}

pub struct Tenant {
    record: TenantRecord,
    runtime: AppRuntime,
    state: TenantState,
    active_requests: u64,
    drain_deadline: Option<Instant>,
}

impl Tenant {
    /// Load the app at the record's path. A failure here is fatal for this
    /// tenant only; the failed isolate is disposed with the error.
    #[instrument(err(Debug), skip(record, events), fields(name = %record.name, hostname = %record.hostname), level = Level::INFO)]
    pub fn load(record: TenantRecord, events: LoopHandle) -> anyhow::Result<Self> {
        let runtime = AppRuntime::new(
            &record.path,
            &record.env,
            record.limits.clone(),
            events,
        )?;
        metrics::counter!(METRIC_APP_LOADS).increment(1);
        metrics::gauge!(METRIC_ACTIVE_APPS).increment(1.0);
        Ok(Self {
            record,
            runtime,
            state: TenantState::Active,
            active_requests: 0,
            drain_deadline: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn hostname(&self) -> &str {
        &self.record.hostname
    }

    pub fn record(&self) -> &TenantRecord {
        &self.record
    }

    pub fn state(&self) -> TenantState {
        self.state
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests
    }

    pub fn timeout_ms(&self) -> u64 {
        self.record.limits.timeout.as_millis() as u64
    }

    /// Engine heap usage as a share of the configured cap.
    pub fn memory_percent(&self) -> f64 {
        let cap = self.record.limits.memory_cap_bytes.max(1);
        (self.runtime.memory_used_bytes() as f64 / cap as f64) * 100.0
    }

    /// Serve one request. The counter moves exactly once up and once down
    /// around the engine invocation.
    pub fn serve(&mut self, request: HttpRequest) -> HttpResponse {
        metrics::counter!(METRIC_REQUESTS).increment(1);
        self.active_requests += 1;
        let response = self.runtime.handle_request(request);
        self.active_requests -= 1;
        if response.status == 504 {
            metrics::counter!(METRIC_WATCHDOG_TERMINATIONS).increment(1);
        }
        response
    }

    /// Stop routing new requests here; in-flight ones run to completion.
    pub fn initiate_drain(&mut self) {
        if self.state == TenantState::Active {
            self.state = TenantState::Draining;
            self.drain_deadline = Some(Instant::now() + DRAIN_DEADLINE);
            tracing::info!(hostname = %self.record.hostname, "tenant draining");
        }
    }

    /// Drained, or past the drain deadline (in which case in-flight
    /// requests race destruction).
    pub fn is_drained(&self) -> bool {
        match self.state {
            TenantState::Active => false,
            TenantState::Stopped => true,
            TenantState::Draining => {
                self.active_requests == 0
                    || self
                        .drain_deadline
                        .map(|deadline| Instant::now() >= deadline)
                        .unwrap_or(false)
            }
        }
    }

    pub fn mark_stopped(&mut self) {
        self.state = TenantState::Stopped;
    }
}

impl Drop for Tenant {
    fn drop(&mut self) {
        metrics::counter!(METRIC_APP_UNLOADS).increment(1);
        metrics::gauge!(METRIC_ACTIVE_APPS).decrement(1.0);
        tracing::debug!(hostname = %self.record.hostname, "tenant destroyed");
    }
}
