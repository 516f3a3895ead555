use sea_orm::entity::prelude::*;
use serde::Serialize;
use time::OffsetDateTime;

/// Node registration; `name` is the last path segment of the node's OpenID URL.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "openid_registration")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,
    pub admin: bool,
    pub validated: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
