use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, ExprTrait, QueryFilter, Schema,
};
use time::OffsetDateTime;

use async_trait::async_trait;
use keygate_common::{GroupConfig, SystemSettings};

use crate::entities;
use crate::logs::RequestLogStore;
use crate::storage::{
    GroupRecord, KeyFailure, KeyRecord, KeyStatus, KeyTouch, RequestLogRecord, Storage,
    StorageError, StorageResult,
};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Sqlite needs foreign keys switched on for cascade deletes.
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn group_from_model(model: entities::groups::Model) -> StorageResult<GroupRecord> {
    let upstreams: Vec<String> = serde_json::from_value(model.upstreams)?;
    if upstreams.is_empty() {
        return Err(StorageError::InvalidRow(format!(
            "group {} has no upstreams",
            model.name
        )));
    }
    let config = match model.config {
        Some(raw) => serde_json::from_value::<GroupConfig>(raw)?,
        None => GroupConfig::default(),
    };
    Ok(GroupRecord {
        id: model.id,
        name: model.name,
        display_name: model.display_name,
        channel_type: model.channel_type,
        upstreams,
        config,
    })
}

fn key_from_model(model: entities::api_keys::Model) -> StorageResult<KeyRecord> {
    let status = KeyStatus::parse(&model.status).ok_or_else(|| {
        StorageError::InvalidRow(format!("key {} has status {:?}", model.id, model.status))
    })?;
    Ok(KeyRecord {
        id: model.id,
        group_id: model.group_id,
        value: model.key_value,
        status,
        request_count: model.request_count,
        failure_count: model.failure_count,
        last_used_at: model.last_used_at,
        last_validated_at: model.last_validated_at,
    })
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Groups)
            .register(entities::ApiKeys)
            .register(entities::RequestLogs)
            .register(entities::SystemSettings)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_groups(&self) -> StorageResult<Vec<GroupRecord>> {
        let rows = entities::Groups::find().all(&self.db).await?;
        rows.into_iter().map(group_from_model).collect()
    }

    async fn load_keys(&self) -> StorageResult<Vec<KeyRecord>> {
        let rows = entities::ApiKeys::find().all(&self.db).await?;
        rows.into_iter().map(key_from_model).collect()
    }

    async fn load_settings(&self) -> StorageResult<SystemSettings> {
        let rows = entities::SystemSettings::find().all(&self.db).await?;
        let mut object = serde_json::Map::new();
        for row in rows {
            // Values are stored as JSON scalars; tolerate bare strings too.
            let value = serde_json::from_str(&row.value)
                .unwrap_or(serde_json::Value::String(row.value));
            object.insert(row.key, value);
        }
        Ok(serde_json::from_value(serde_json::Value::Object(object))?)
    }

    async fn upsert_setting(&self, key: &str, value: &serde_json::Value) -> StorageResult<()> {
        use entities::system_settings::Column;

        let active = entities::system_settings::ActiveModel {
            key: ActiveValue::Set(key.to_string()),
            value: ActiveValue::Set(value.to_string()),
            description: ActiveValue::NotSet,
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::SystemSettings::insert(active)
            .on_conflict(
                OnConflict::column(Column::Key)
                    .update_columns([Column::Value, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn touch_keys(&self, touches: &[KeyTouch]) -> StorageResult<()> {
        use entities::api_keys::Column;

        for touch in touches {
            entities::ApiKeys::update_many()
                .col_expr(Column::LastUsedAt, Expr::value(Some(touch.at)))
                .col_expr(
                    Column::RequestCount,
                    Expr::col(Column::RequestCount).add(1),
                )
                .col_expr(Column::FailureCount, Expr::value(0i64))
                .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
                .filter(Column::Id.eq(touch.key_id))
                .exec(&self.db)
                .await?;
        }
        Ok(())
    }

    async fn record_key_failures(&self, failures: &[KeyFailure]) -> StorageResult<()> {
        use entities::api_keys::Column;

        for failure in failures {
            entities::ApiKeys::update_many()
                .col_expr(Column::FailureCount, Expr::value(failure.failure_count))
                .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
                .filter(Column::Id.eq(failure.key_id))
                .exec(&self.db)
                .await?;
        }
        Ok(())
    }

    async fn set_key_status(
        &self,
        key_id: i64,
        status: KeyStatus,
        failure_count: i64,
        validated_at: Option<OffsetDateTime>,
    ) -> StorageResult<()> {
        use entities::api_keys::Column;

        let mut update = entities::ApiKeys::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::FailureCount, Expr::value(failure_count))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()));
        if validated_at.is_some() {
            update = update.col_expr(Column::LastValidatedAt, Expr::value(validated_at));
        }
        update.filter(Column::Id.eq(key_id)).exec(&self.db).await?;
        Ok(())
    }
}

#[async_trait]
impl RequestLogStore for SeaOrmStorage {
    async fn insert_request_logs(&self, rows: &[RequestLogRecord]) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let models = rows.iter().map(|row| entities::request_logs::ActiveModel {
            id: ActiveValue::Set(row.id.to_string()),
            at: ActiveValue::Set(row.at),
            group_id: ActiveValue::Set(row.group_id),
            group_name: ActiveValue::Set(row.group_name.clone()),
            key_value: ActiveValue::Set(row.key_value.clone()),
            source_ip: ActiveValue::Set(row.source_ip.clone()),
            status_code: ActiveValue::Set(i32::from(row.status_code)),
            request_path: ActiveValue::Set(row.request_path.clone()),
            request_body_snippet: ActiveValue::Set(row.request_body_snippet.clone()),
            upstream_addr: ActiveValue::Set(row.upstream_addr.clone()),
            attempt: ActiveValue::Set(row.attempt as i32),
            duration_ms: ActiveValue::Set(row.duration_ms),
            error_message: ActiveValue::Set(row.error_message.clone()),
        });
        entities::RequestLogs::insert_many(models)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_request_logs_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        use entities::request_logs::Column;

        let result = entities::RequestLogs::delete_many()
            .filter(Column::At.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
