use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn register_resource(
        &self,
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        if self.tables.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        let txn = self.begin().await?;
        if self.tables.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.commit(txn, Event::ResourceRegistered { id, kind, name }).await?;
        tracing::info!("registered {} {id}", kind.as_str());
        Ok(())
    }

    pub async fn register_vehicle(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        self.register_resource(id, ResourceKind::Vehicle, name).await
    }

    pub async fn register_driver(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        self.register_resource(id, ResourceKind::Driver, name).await
    }

    pub async fn register_customer(
        &self,
        id: Ulid,
        name: String,
        phone: Option<String>,
    ) -> Result<(), EngineError> {
        if self.tables.customers.len() >= MAX_CUSTOMERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many customers"));
        }
        if name.len() > MAX_NAME_LEN || phone.as_ref().is_some_and(|p| p.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("customer name or phone too long"));
        }
        let txn = self.begin().await?;
        if self.tables.customers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.commit(txn, Event::CustomerRegistered { id, name, phone }).await
    }

    /// Set or clear the operator flag (maintenance / off duty).
    /// Returns the resulting effective status.
    pub async fn set_flag(
        &self,
        id: Ulid,
        flag: Option<ResourceFlag>,
    ) -> Result<ResourceStatus, EngineError> {
        let mut txn = self.begin().await?;
        self.lock_resources(&mut txn, &[id]).await?;
        let rs = txn.resource(&id).ok_or(EngineError::NotFound(id))?;
        if rs.flag == flag {
            return Ok(rs.effective_status());
        }
        if flag == Some(ResourceFlag::Maintenance) && !rs.allocations.is_empty() {
            tracing::warn!(
                "{} {id} flagged for maintenance with {} active bookings",
                rs.kind.as_str(),
                rs.allocations.len()
            );
        }
        let status = flag.map(ResourceStatus::from).unwrap_or(rs.status);
        self.commit(txn, Event::ResourceFlagged { id, flag }).await?;
        Ok(status)
    }

    pub(super) fn expect_customer(&self, id: Ulid) -> Result<(), EngineError> {
        if self.tables.customers.contains_key(&id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(id))
        }
    }
}
