//! Node registrations consulted when a node identity logs in.

use crate::entity::openid_registration;
use crate::error::RegistrationError;
use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub admin: bool,
    pub validated: bool,
}

impl From<openid_registration::Model> for Registration {
    fn from(model: openid_registration::Model) -> Self {
        Self {
            name: model.name,
            admin: model.admin,
            validated: model.validated,
        }
    }
}

#[async_trait]
pub trait RegistrationSource: Send + Sync {
    /// `RegistrationError::NotFound` when no registration has this name.
    async fn load(&self, name: &str) -> Result<Registration, RegistrationError>;
}

/// Registrations kept in the `openid_registration` table.
#[derive(Clone, Debug)]
pub struct DbRegistrations {
    db: Arc<DatabaseConnection>,
}

impl DbRegistrations {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, registration: &Registration) -> Result<(), RegistrationError> {
        openid_registration::ActiveModel {
            name: Set(registration.name.clone()),
            admin: Set(registration.admin),
            validated: Set(registration.validated),
            created_at: Set(OffsetDateTime::now_utc()),
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RegistrationSource for DbRegistrations {
    #[tracing::instrument(skip(self))]
    async fn load(&self, name: &str) -> Result<Registration, RegistrationError> {
        openid_registration::Entity::find_by_id(name.to_string())
            .one(self.db.as_ref())
            .await?
            .map(Registration::from)
            .ok_or_else(|| RegistrationError::NotFound(name.to_string()))
    }
}
