//! # Policy
//!
//! Authorization of staff actions against the pipeline, based on role assignment records.
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
pub enum Role {
    Admin,
    Staff,
    Citizen,
}

/// Actions against the enrichment pipeline that require authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Request a new enrichment attempt for a failed report.
    Reenrich,
    /// Read a report's pipeline status and enrichment attributes.
    ViewPipeline,
}

impl Role {
    pub fn permits(&self, action: Action) -> bool {
        match (self, action) {
            (Role::Admin, _) => true,
            (Role::Staff, Action::Reenrich | Action::ViewPipeline) => true,
            (Role::Citizen, _) => false,
        }
    }
}

/// Source of role assignment records.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn roles_for(&self, user_id: Uuid) -> StoreResult<Vec<Role>>;
}

/// Grants an action when any role assigned to the user permits it.
#[derive(Clone)]
pub struct RolePolicy {
    directory: Arc<dyn RoleDirectory>,
}

impl RolePolicy {
    pub fn new(directory: Arc<dyn RoleDirectory>) -> Self {
        Self { directory }
    }

    pub async fn allows(&self, user_id: Uuid, action: Action) -> StoreResult<bool> {
        let roles = self.directory.roles_for(user_id).await?;

        Ok(roles.iter().any(|role| role.permits(action)))
    }
}
