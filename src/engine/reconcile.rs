use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

/// What one `reconcile_all` pass found and fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub resources_checked: usize,
    pub resources_corrected: usize,
    pub customers_checked: usize,
    pub balances_corrected: usize,
}

impl ReconcileSummary {
    pub fn corrected(&self) -> usize {
        self.resources_corrected + self.balances_corrected
    }
}

/// `Booked` while some active allocation has not yet ended.
fn expected_status(rs: &ResourceState, now: Ms) -> ResourceStatus {
    if rs.allocations.iter().any(|a| a.window.end >= now) {
        ResourceStatus::Booked
    } else {
        ResourceStatus::Available
    }
}

impl Engine {
    /// Recompute a resource's lifecycle status from its allocations and
    /// correct the cached value if it drifted.
    pub async fn reconcile_resource(&self, resource_id: Ulid) -> Result<StatusReport, EngineError> {
        let mut txn = self.begin().await?;
        self.lock_resources(&mut txn, &[resource_id]).await?;
        let rs = txn.resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let report = StatusReport {
            resource_id,
            previous: rs.status,
            current: expected_status(rs, self.now()),
        };
        if !report.drifted() {
            return Ok(report);
        }

        metrics::counter!(
            observability::RECONCILE_DRIFT_TOTAL,
            "kind" => rs.kind.as_str()
        )
        .increment(1);
        warn!(
            "{} {resource_id} status drifted: cached {:?}, allocations say {:?}",
            rs.kind.as_str(),
            report.previous,
            report.current
        );
        self.commit(
            txn,
            Event::ResourceStatusReconciled {
                id: resource_id,
                status: report.current,
            },
        )
        .await?;
        Ok(report)
    }

    /// Report drift without correcting it.
    pub async fn verify_resource(&self, resource_id: Ulid) -> Result<(), EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = tokio::time::timeout(self.lock_timeout, rs.read())
            .await
            .map_err(|_| self.lock_timed_out("resource lock"))?;
        let expected = expected_status(&guard, self.now());
        if guard.status != expected {
            return Err(EngineError::Consistency(format!(
                "{} {resource_id} is {:?} but allocations say {:?}",
                guard.kind.as_str(),
                guard.status,
                expected
            )));
        }
        Ok(())
    }

    /// Reconcile every resource status and customer balance of this tenant.
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary, EngineError> {
        let mut summary = ReconcileSummary::default();

        let mut resource_ids: Vec<Ulid> = self.tables.resources.iter().map(|e| *e.key()).collect();
        resource_ids.sort();
        for id in resource_ids {
            summary.resources_checked += 1;
            if self.reconcile_resource(id).await?.drifted() {
                summary.resources_corrected += 1;
            }
        }

        let mut customer_ids: Vec<Ulid> = self.tables.customers.iter().map(|e| *e.key()).collect();
        customer_ids.sort();
        for id in customer_ids {
            summary.customers_checked += 1;
            if self.reconcile_balance(id).await?.1 {
                summary.balances_corrected += 1;
            }
        }

        if summary.corrected() > 0 {
            info!(
                "reconciliation corrected {} resources and {} balances",
                summary.resources_corrected, summary.balances_corrected
            );
        }
        Ok(summary)
    }
}
