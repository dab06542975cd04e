use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Deployment {
    pub deployment_id: String,
    pub start_version: String,
    pub target_version: String,
    pub status: String,
    pub current_step: String,
    pub backup_id: Option<String>,
    pub owner: String,
    pub started: String,
    pub ended: String,
    pub error: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub status: Option<String>,
    pub current_step: Option<String>,
    pub backup_id: Option<String>,
    pub ended: Option<String>,
    pub error: Option<String>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    deployment: &Deployment,
) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO deployments (deployment_id, start_version, target_version, status, current_step, backup_id, \
        owner, started, ended, error) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&deployment.deployment_id)
    .bind(&deployment.start_version)
    .bind(&deployment.target_version)
    .bind(&deployment.status)
    .bind(&deployment.current_step)
    .bind(&deployment.backup_id)
    .bind(&deployment.owner)
    .bind(&deployment.started)
    .bind(&deployment.ended)
    .bind(&deployment.error);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Returns deployments most recent first.
pub async fn list(conn: &mut SqliteConnection, limit: u64) -> Result<Vec<Deployment>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    // UUIDv7 identifiers are time ordered so they make a stable tie breaker for deployments started within the
    // same millisecond.
    let query = sqlx::query_as::<_, Deployment>(
        "SELECT deployment_id, start_version, target_version, status, current_step, backup_id, owner, started, ended, \
        error FROM deployments ORDER BY CAST(started AS INTEGER) DESC, deployment_id DESC LIMIT ?;",
    )
    .bind(limit as i64);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn list_in_progress(
    conn: &mut SqliteConnection,
) -> Result<Vec<Deployment>, StorageError> {
    let query = sqlx::query_as::<_, Deployment>(
        "SELECT deployment_id, start_version, target_version, status, current_step, backup_id, owner, started, ended, \
        error FROM deployments WHERE status = 'in_progress';",
    );

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(
    conn: &mut SqliteConnection,
    deployment_id: &str,
) -> Result<Deployment, StorageError> {
    let query = sqlx::query_as::<_, Deployment>(
        "SELECT deployment_id, start_version, target_version, status, current_step, backup_id, owner, started, ended, \
        error FROM deployments WHERE deployment_id = ?;",
    )
    .bind(deployment_id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get_latest(conn: &mut SqliteConnection) -> Result<Deployment, StorageError> {
    let query = sqlx::query_as::<_, Deployment>(
        "SELECT deployment_id, start_version, target_version, status, current_step, backup_id, owner, started, ended, \
        error FROM deployments ORDER BY CAST(started AS INTEGER) DESC, deployment_id DESC LIMIT 1;",
    );

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    deployment_id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE deployments SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.current_step {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("current_step = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.backup_id {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("backup_id = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.ended {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("ended = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.error {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("error = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    // If no fields were updated, return an error
    if updated_fields_total == 0 {
        return Err(StorageError::NoFieldsUpdated);
    }

    update_query.push(" WHERE deployment_id = ");
    update_query.push_bind(deployment_id);
    update_query.push(";");

    let update_query = update_query.build();

    let sql = update_query.sql();

    update_query
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
}
