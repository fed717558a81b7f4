use std::sync::Mutex;

use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};

use scanstate_api::{
    EntityKey, Observation, ObservationRecord, Page, StateStore, StoreError, StoreFuture,
    StoreKind,
};

const SQL_SCHEMA: &str = include_str!("../sql/schema.sql");
const SQL_UPSERT: &str = include_str!("../sql/upsert.sql");

const SQL_GET: &str = "SELECT ip, port, service, last_timestamp, response, updated_at \
     FROM service_records WHERE ip = $1 AND port = $2 AND service = $3";

// LIMIT NULL is LIMIT ALL.
const SQL_LIST: &str = "SELECT ip, port, service, last_timestamp, response, updated_at \
     FROM service_records \
     ORDER BY last_timestamp DESC, ip ASC, port ASC, service ASC \
     LIMIT $1 OFFSET $2";

/// Client-server SQL store.
///
/// The conditional upsert is a single statement, so PostgreSQL's row lock on
/// the conflicting key serializes concurrent writers from any number of
/// processes. Statements from concurrent workers are pipelined over one
/// connection. A lost connection is re-established by the next call.
pub struct PostgresStore {
    conn_str: String,
    /// `None` once closed.
    client: RwLock<Option<Client>>,
    connection: Mutex<Option<JoinHandle<()>>>,
}

async fn establish(conn_str: &str) -> Result<(Client, JoinHandle<()>), StoreError> {
    let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
        .await
        .map_err(|e| StoreError::Connection(format!("connect: {e}")))?;

    let handle = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "postgres connection error");
        }
    });
    Ok((client, handle))
}

impl PostgresStore {
    /// Connect with a libpq-style connection string, verify the connection
    /// and create the schema if absent.
    pub async fn connect(conn_str: &str) -> Result<Self, StoreError> {
        let (client, handle) = establish(conn_str).await?;

        let store = Self {
            conn_str: conn_str.to_string(),
            client: RwLock::new(Some(client)),
            connection: Mutex::new(Some(handle)),
        };

        if let Err(e) = store.bootstrap().await {
            let _ = store.close().await;
            return Err(e);
        }

        tracing::info!("postgres store connected");
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| map_pg_error(e).with_context("ping"))?;
        client
            .batch_execute(SQL_SCHEMA)
            .await
            .map_err(|e| map_pg_error(e).with_context("create schema"))?;
        Ok(())
    }

    /// A live client, reconnecting first if the connection was lost.
    async fn client(&self) -> Result<RwLockReadGuard<'_, Client>, StoreError> {
        let guard = self.client.read().await;
        let live = match guard.as_ref() {
            None => return Err(StoreError::Closed),
            Some(c) => !c.is_closed(),
        };
        if live {
            return RwLockReadGuard::try_map(guard, Option::as_ref).map_err(|_| StoreError::Closed);
        }
        drop(guard);

        self.reconnect().await?;
        RwLockReadGuard::try_map(self.client.read().await, Option::as_ref)
            .map_err(|_| StoreError::Closed)
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let mut guard = self.client.write().await;
        match guard.as_ref() {
            None => return Err(StoreError::Closed),
            // Another caller got here first.
            Some(c) if !c.is_closed() => return Ok(()),
            Some(_) => {}
        }

        tracing::warn!("postgres connection lost, reconnecting");
        let (client, handle) = establish(&self.conn_str)
            .await
            .map_err(|e| e.with_context("reconnect"))?;
        *guard = Some(client);

        let previous = self
            .connection
            .lock()
            .map_err(|_| StoreError::Connection("connection handle mutex poisoned".into()))?
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::info!("postgres store reconnected");
        Ok(())
    }
}

impl StateStore for PostgresStore {
    fn upsert<'a>(&'a self, observation: &'a Observation) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let client = self.client().await?;
            let port = i64::from(observation.key.port());
            let rows = client
                .execute(
                    SQL_UPSERT,
                    &[
                        &observation.key.ip(),
                        &port,
                        &observation.key.service(),
                        &observation.event_timestamp,
                        &observation.payload,
                    ],
                )
                .await
                .map_err(|e| map_pg_error(e).with_context("upsert"))?;
            Ok(rows > 0)
        })
    }

    fn get<'a>(&'a self, key: &'a EntityKey) -> StoreFuture<'a, Option<ObservationRecord>> {
        Box::pin(async move {
            let client = self.client().await?;
            let port = i64::from(key.port());
            let row = client
                .query_opt(SQL_GET, &[&key.ip(), &port, &key.service()])
                .await
                .map_err(|e| map_pg_error(e).with_context("get"))?;
            row.as_ref().map(map_row).transpose()
        })
    }

    fn list(&self, page: Page) -> StoreFuture<'_, Vec<ObservationRecord>> {
        Box::pin(async move {
            let client = self.client().await?;
            let limit = page.sql_limit();
            let offset = page.sql_offset();
            let rows = client
                .query(SQL_LIST, &[&limit, &offset])
                .await
                .map_err(|e| map_pg_error(e).with_context("list"))?;
            rows.iter().map(map_row).collect()
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            // Dropping the client ends the connection task.
            let client = self.client.write().await.take();
            if client.is_none() {
                return Ok(());
            }
            drop(client);

            let handle = self
                .connection
                .lock()
                .map_err(|_| StoreError::Connection("connection handle mutex poisoned".into()))?
                .take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            tracing::info!("postgres store closed");
            Ok(())
        })
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Postgres
    }
}

fn map_row(row: &Row) -> Result<ObservationRecord, StoreError> {
    let get_err = |e: tokio_postgres::Error| StoreError::Query(format!("row mapping: {e}"));

    let port: i64 = row.try_get("port").map_err(get_err)?;
    let port = u32::try_from(port)
        .map_err(|_| StoreError::Constraint(format!("stored port {port} out of range")))?;
    let updated_at: chrono::NaiveDateTime = row.try_get("updated_at").map_err(get_err)?;

    Ok(ObservationRecord {
        key: EntityKey::new(
            row.try_get::<_, String>("ip").map_err(get_err)?,
            port,
            row.try_get::<_, String>("service").map_err(get_err)?,
        ),
        event_timestamp: row.try_get("last_timestamp").map_err(get_err)?,
        payload: row.try_get("response").map_err(get_err)?,
        ingested_at: updated_at.and_utc(),
    })
}

fn map_pg_error(e: tokio_postgres::Error) -> StoreError {
    if e.is_closed() {
        return StoreError::Connection(e.to_string());
    }
    match e.code() {
        // Class 22 (data exception), 23 (integrity constraint violation).
        Some(state) if state.code().starts_with("22") || state.code().starts_with("23") => {
            StoreError::Constraint(e.to_string())
        }
        // Class 08 (connection exception), 57 (operator intervention).
        Some(state) if state.code().starts_with("08") || state.code().starts_with("57") => {
            StoreError::Connection(e.to_string())
        }
        Some(_) => StoreError::Query(e.to_string()),
        None => StoreError::Connection(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::*;

    const URL_ENV: &str = "SCANSTATE_TEST_POSTGRES_URL";

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        let err = PostgresStore::connect("host=127.0.0.1 port=1 user=scan connect_timeout=2")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Connection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn recovers_after_server_drops_connection() {
        let Ok(url) = std::env::var(URL_ENV) else {
            return;
        };
        let store = PostgresStore::connect(&url).await.unwrap();
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let key = EntityKey::new(format!("10.9.9.9-{}-{nanos}", std::process::id()), 80, "HTTP");
        assert!(store.upsert(&Observation::new(key.clone(), 1, "before")).await.unwrap());

        {
            let guard = store.client.read().await;
            let client = guard.as_ref().unwrap();
            let _ = client.simple_query("SELECT pg_terminate_backend(pg_backend_pid())").await;
            for _ in 0..50 {
                if client.is_closed() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            assert!(client.is_closed());
        }

        assert!(store.upsert(&Observation::new(key.clone(), 2, "after")).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().unwrap().payload, "after");

        store.close().await.unwrap();
        assert_eq!(store.get(&key).await, Err(StoreError::Closed));
    }
}
