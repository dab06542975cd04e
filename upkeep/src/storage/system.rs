use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct System {
    /// Empty until the first start seeds it from configuration.
    pub current_version: String,

    /// Epoch milliseconds of the last update check that reached the feed. "0" if never.
    pub last_checked: String,
}

pub async fn get_system_parameters(conn: &mut SqliteConnection) -> Result<System, StorageError> {
    let query =
        sqlx::query_as::<_, System>("SELECT current_version, last_checked FROM system WHERE id = 1;");

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update_system_parameters(
    conn: &mut SqliteConnection,
    current_version: Option<String>,
    last_checked: Option<String>,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE system SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &current_version {
        update_query.push("current_version = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &last_checked {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("last_checked = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    // If no fields were updated, return an error
    if updated_fields_total == 0 {
        return Err(StorageError::NoFieldsUpdated);
    }

    update_query.push(" WHERE id = 1;");

    let update_query = update_query.build();

    let sql = update_query.sql();

    update_query
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
}
