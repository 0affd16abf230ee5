//! `PostgreSQL` target connections.
//!
//! Each entity lands in `"<schema>"."<entity>"` as one JSONB row per record,
//! keyed by the record's primary key. Commits upsert, so replaying a batch
//! is idempotent.

use std::collections::HashSet;

use postgres::{Client, NoTls};
use wmsync_types::record::Record;
use wmsync_types::state::EntityName;

use super::{Connector, DbConnection};
use crate::error::ConnectionError;
use crate::validator::key_text;

/// Opens [`PgConnection`]s from a libpq-style connection string.
#[derive(Debug, Clone)]
pub struct PgConnector {
    connection: String,
    schema: String,
}

impl PgConnector {
    #[must_use]
    pub fn new(connection: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            schema: schema.into(),
        }
    }
}

impl Connector for PgConnector {
    fn connect(&self) -> Result<Box<dyn DbConnection>, ConnectionError> {
        let client = Client::connect(&self.connection, NoTls).map_err(|e| classify(&e))?;
        Ok(Box::new(PgConnection {
            client,
            schema: self.schema.clone(),
            created_tables: HashSet::new(),
        }))
    }
}

pub struct PgConnection {
    client: Client,
    schema: String,
    created_tables: HashSet<EntityName>,
}

impl PgConnection {
    fn qualified_table(&self, entity: &EntityName) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(entity.as_str()))
    }
}

impl DbConnection for PgConnection {
    fn ping(&mut self) -> Result<(), ConnectionError> {
        self.client
            .simple_query("SELECT 1")
            .map(|_| ())
            .map_err(|e| classify(&e))
    }

    fn commit_batch(
        &mut self,
        entity: &EntityName,
        primary_key: &str,
        records: &[Record],
    ) -> Result<u64, ConnectionError> {
        let table = self.qualified_table(entity);
        let keys = records
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                record_key(record, primary_key).ok_or_else(|| {
                    ConnectionError::Rejected(format!(
                        "{entity} record {idx} has no value for primary key '{primary_key}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ensure_table = !self.created_tables.contains(entity);
        let mut tx = self.client.transaction().map_err(|e| classify(&e))?;

        if ensure_table {
            let ddl = format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {table} (
                    _wm_key       TEXT PRIMARY KEY,
                    _wm_record    JSONB NOT NULL,
                    _wm_synced_at TIMESTAMPTZ NOT NULL DEFAULT now()
                 );",
                schema = quote_ident(&self.schema),
            );
            tx.batch_execute(&ddl).map_err(|e| classify(&e))?;
        }

        let upsert = format!(
            "INSERT INTO {table} (_wm_key, _wm_record, _wm_synced_at) VALUES ($1, $2, now())
             ON CONFLICT (_wm_key) DO UPDATE
             SET _wm_record = EXCLUDED._wm_record, _wm_synced_at = EXCLUDED._wm_synced_at"
        );
        let stmt = tx.prepare(&upsert).map_err(|e| classify(&e))?;

        let mut written = 0u64;
        for (key, record) in keys.iter().zip(records) {
            let payload = serde_json::Value::Object(record.clone());
            written += tx
                .execute(&stmt, &[key, &payload])
                .map_err(|e| classify(&e))?;
        }
        tx.commit().map_err(|e| classify(&e))?;

        if ensure_table {
            self.created_tables.insert(entity.clone());
        }
        Ok(written)
    }

    fn table_exists(&mut self, entity: &EntityName) -> Result<bool, ConnectionError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                 )",
                &[&self.schema, &entity.as_str()],
            )
            .map_err(|e| classify(&e))?;
        Ok(row.get(0))
    }

    fn key_exists(&mut self, entity: &EntityName, key: &str) -> Result<bool, ConnectionError> {
        if !self.created_tables.contains(entity) && !self.table_exists(entity)? {
            return Ok(false);
        }
        let query = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE _wm_key = $1)",
            self.qualified_table(entity)
        );
        let row = self
            .client
            .query_one(&query, &[&key])
            .map_err(|e| classify(&e))?;
        Ok(row.get(0))
    }
}

/// Key text for a record, or `None` when the key is missing or null.
fn record_key(record: &Record, primary_key: &str) -> Option<String> {
    record.get(primary_key).and_then(key_text)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Closed sockets and connection/auth/shutdown SQLSTATE classes are fatal;
/// everything else may succeed on retry.
fn classify(err: &postgres::Error) -> ConnectionError {
    let message = err.to_string();
    if err.is_closed() {
        return ConnectionError::Fatal(message);
    }
    match err.code().map(postgres::error::SqlState::code) {
        Some(code)
            if ["08", "28", "3D", "57"]
                .iter()
                .any(|class| code.starts_with(class)) =>
        {
            ConnectionError::Fatal(message)
        }
        _ => ConnectionError::Transient(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn record_key_renders_strings_bare() {
        assert_eq!(
            record_key(&record(json!({"sku": "A-1"})), "sku").as_deref(),
            Some("A-1")
        );
        assert_eq!(
            record_key(&record(json!({"id": 42})), "id").as_deref(),
            Some("42")
        );
    }

    #[test]
    fn record_key_missing_or_null_is_none() {
        assert!(record_key(&record(json!({"id": null})), "id").is_none());
        assert!(record_key(&record(json!({"other": 1})), "id").is_none());
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let connector = PgConnector::new("host=127.0.0.1 port=9 user=wm connect_timeout=1", "public");
        assert!(connector.connect().is_err());
    }
}
