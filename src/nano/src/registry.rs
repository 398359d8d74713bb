//! The tenant registry: hostname → tenant, with a default fallback and the
//! reconcile diff used by both hot reload and the management API.
//!
//! All mutation happens on the engine-driving thread between request
//! dispatches; there is no interior locking to get wrong. Draining tenants
//! stay in the map (so routing can answer 503 for them) until the sweep
//! destroys them.

use std::collections::HashMap;

use anyhow::{anyhow, bail};
use nano_runtime::LoopHandle;

use crate::config::TenantRecord;
use crate::tenant::{Tenant, TenantState};

/// Strip the port and any trailing dot, lowercase the rest.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}

pub struct Registry {
    tenants: HashMap<String, Tenant>,
    /// Hostnames in insertion order; the first active one is the default.
    order: Vec<String>,
    events: LoopHandle,
}

impl Registry {
    pub fn new(events: LoopHandle) -> Self {
        Self {
            tenants: HashMap::new(),
            order: Vec::new(),
            events,
        }
    }

    fn active_count(&self) -> usize {
        self.tenants
            .values()
            .filter(|t| t.state() == TenantState::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.active_count()
    }

    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }

    pub fn default_hostname(&self) -> Option<&str> {
        self.order
            .iter()
            .find(|host| {
                self.tenants
                    .get(*host)
                    .map(|t| t.state() == TenantState::Active)
                    .unwrap_or(false)
            })
            .map(String::as_str)
    }

    pub fn get(&self, hostname: &str) -> Option<&Tenant> {
        self.tenants.get(&normalize_host(hostname))
    }

    /// Case-insensitive lookup with port and trailing dot stripped. An
    /// unknown host falls through to the default (first-inserted active)
    /// tenant; a known-but-draining host is returned as-is so the caller
    /// can answer 503.
    pub fn lookup_mut(&mut self, host: &str) -> Option<&mut Tenant> {
        let key = normalize_host(host);
        let key = if self.tenants.contains_key(&key) {
            key
        } else {
            self.default_hostname()?.to_string()
        };
        self.tenants.get_mut(&key)
    }

    pub fn add(&mut self, record: TenantRecord) -> anyhow::Result<()> {
        let hostname = record.hostname.clone();
        if self.tenants.contains_key(&hostname) {
            bail!("hostname already exists: {hostname}");
        }
        let tenant = Tenant::load(record, self.events.clone())?;
        self.order.push(hostname.clone());
        self.tenants.insert(hostname, tenant);
        Ok(())
    }

    /// Begin draining a tenant. The registry never empties: the last active
    /// tenant is undeletable.
    pub fn remove(&mut self, host: &str) -> anyhow::Result<()> {
        let key = normalize_host(host);
        let state = match self.tenants.get(&key) {
            Some(tenant) => tenant.state(),
            None => return Err(anyhow!("not found: {key}")),
        };
        if state == TenantState::Active && self.active_count() == 1 {
            bail!("cannot remove last tenant");
        }
        if let Some(tenant) = self.tenants.get_mut(&key) {
            tenant.initiate_drain();
        }
        Ok(())
    }

    /// Diff the registry against a config snapshot: new records are added,
    /// missing hostnames removed, changed paths logged but left alone.
    /// Failures are logged and the remaining records still processed.
    pub fn reconcile(&mut self, records: Vec<TenantRecord>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for record in &records {
            match self.tenants.get(&record.hostname) {
                None => match self.add(record.clone()) {
                    Ok(()) => summary.added += 1,
                    Err(err) => {
                        tracing::warn!(
                            hostname = %record.hostname,
                            error = %format!("{err:#}"),
                            "reconcile: failed to add tenant"
                        );
                        summary.failed += 1;
                    }
                },
                Some(existing) => {
                    if existing.record().path != record.path {
                        // TODO: replace-with-drain when the path changes;
                        // today the tenant is treated as unchanged.
                        tracing::warn!(
                            hostname = %record.hostname,
                            old_path = %existing.record().path.display(),
                            new_path = %record.path.display(),
                            "reconcile: path changed for existing tenant, not migrating"
                        );
                    }
                    summary.kept += 1;
                }
            }
        }

        let wanted: Vec<&str> = records.iter().map(|r| r.hostname.as_str()).collect();
        let stale: Vec<String> = self
            .tenants
            .iter()
            .filter(|(host, tenant)| {
                tenant.state() == TenantState::Active && !wanted.contains(&host.as_str())
            })
            .map(|(host, _)| host.clone())
            .collect();
        for host in stale {
            match self.remove(&host) {
                Ok(()) => summary.removed += 1,
                Err(err) => {
                    tracing::warn!(
                        hostname = %host,
                        error = %format!("{err:#}"),
                        "reconcile: failed to remove tenant"
                    );
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Mark every tenant draining (shutdown path).
    pub fn drain_all(&mut self) {
        for tenant in self.tenants.values_mut() {
            tenant.initiate_drain();
        }
    }

    pub fn all_drained(&self) -> bool {
        self.tenants.values().all(|t| t.is_drained())
    }

    /// Destroy draining tenants whose drain has completed or expired.
    pub fn sweep(&mut self) {
        let done: Vec<String> = self
            .tenants
            .iter()
            .filter(|(_, tenant)| tenant.state() == TenantState::Draining && tenant.is_drained())
            .map(|(host, _)| host.clone())
            .collect();
        for host in done {
            if let Some(mut tenant) = self.tenants.remove(&host) {
                tenant.mark_stopped();
            }
            self.order.retain(|h| *h != host);
        }
    }

    /// Active tenants in insertion order.
    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.order.iter().filter_map(|host| {
            self.tenants
                .get(host)
                .filter(|t| t.state() == TenantState::Active)
        })
    }
}

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_normalization() {
        assert_eq!(normalize_host("A.Example.COM"), "a.example.com");
        assert_eq!(normalize_host("a.local:8080"), "a.local");
        assert_eq!(normalize_host("a.local."), "a.local");
        assert_eq!(normalize_host(" A.Local.:9090 "), "a.local");
    }
}
