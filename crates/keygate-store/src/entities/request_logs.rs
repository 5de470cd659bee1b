use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub at: OffsetDateTime,
    /// Snapshot columns; the group or key may be deleted later.
    pub group_id: i64,
    pub group_name: String,
    pub key_value: String,
    pub source_ip: String,
    pub status_code: i32,
    pub request_path: String,
    pub request_body_snippet: String,
    pub upstream_addr: String,
    pub attempt: i32,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

impl ActiveModelBehavior for ActiveModel {}
