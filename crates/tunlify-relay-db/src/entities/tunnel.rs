//! Tunnel entity: one row per named route a client can bind to

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Coarse tunnel status as shown to the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[sea_orm(string_value = "inactive")]
    Inactive,

    #[sea_orm(string_value = "active")]
    Active,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    /// Tunnel UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// User who owns this tunnel
    pub owner_id: Uuid,

    /// Owner email, used only for diagnostic response headers
    pub owner_email: Option<String>,

    /// Subdomain label; unique together with `region`
    pub subdomain: String,

    /// Server location code (e.g. "us", "id", "sg")
    pub region: String,

    /// Secret the client presents when opening its channel
    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub connection_token: String,

    pub status: TunnelStatus,

    /// Whether a client session is currently bound
    pub client_connected: bool,

    pub created_at: ChronoDateTimeUtc,

    pub last_connected_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
