//! AccountCredential entity model
//!
//! Tokens for the remote network, one row per account owner. Rows are created
//! by the auth subsystem; the refresher only rotates tokens in place.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "account_credentials")]
pub struct Model {
    /// Account owner (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub owner_id: Uuid,

    /// Bearer token used for lookup calls
    pub access_token: String,

    /// Refresh token, absent for app-only or legacy grants
    pub refresh_token: Option<String>,

    /// Access token expiry, `None` when the token does not expire
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Remote account the owner authenticated as
    pub remote_account_id: Option<String>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
