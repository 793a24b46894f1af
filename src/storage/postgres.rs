use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use super::models::{
    NewCrawlResult, NewProxy, NewTask, ProductRecord, Proxy, ProxyScheme, Task, PAYLOAD_OVERRIDES_KEY,
};
use super::Repository;
use crate::cli::config::StorageSettings;
use crate::crawler::task::{TaskStatus, TaskType};
use crate::error::StorageError;

const TASK_COLUMNS: &str =
    "id, name, url, type, status, config, created_at, updated_at, started_at, completed_at";
const PROXY_COLUMNS: &str =
    "id, host, port, type, username, password, is_active, failure_count, last_checked, created_at, updated_at";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        config TEXT NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS proxies (
        id BIGSERIAL PRIMARY KEY,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        type TEXT NOT NULL,
        username TEXT,
        password TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        failure_count INTEGER NOT NULL DEFAULT 0,
        last_checked TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS products (
        id BIGSERIAL PRIMARY KEY,
        external_id TEXT NOT NULL UNIQUE,
        product_id TEXT,
        name TEXT,
        brand TEXT,
        catalog TEXT,
        artist TEXT,
        rating DOUBLE PRECISION,
        list_price DOUBLE PRECISION,
        sale_price DOUBLE PRECISION,
        in_stock BOOLEAN NOT NULL DEFAULT FALSE,
        raw_data JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS crawl_results (
        id BIGSERIAL PRIMARY KEY,
        task_id BIGINT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        headers JSONB NOT NULL,
        body TEXT NOT NULL,
        response_time_ms BIGINT NOT NULL,
        proxy_used TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS crawler_settings (
        settings_key TEXT PRIMARY KEY,
        value JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
];

/// PostgreSQL implementation of the repository
pub struct PostgresRepository {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,
}

impl PostgresRepository {
    /// Connect and make sure the tables exist
    pub async fn connect(settings: &StorageSettings) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.database_url)
            .await?;

        let repo = Self { pool };
        repo.ensure_schema().await?;

        debug!("Connected to PostgreSQL database");

        Ok(repo)
    }

    /// Create missing tables
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!("Ensured crawler tables exist");

        Ok(())
    }
}

fn decode_err(column: &str, e: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.to_string().into(),
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, sqlx::Error> {
    let task_type: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;

    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        task_type: task_type.parse::<TaskType>().map_err(|e| decode_err("type", e))?,
        status: status.parse::<TaskStatus>().map_err(|e| decode_err("status", e))?,
        config: row.try_get("config")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn proxy_from_row(row: &PgRow) -> Result<Proxy, sqlx::Error> {
    let proxy_type: String = row.try_get("type")?;
    let port: i32 = row.try_get("port")?;

    Ok(Proxy {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        port: u16::try_from(port).map_err(|e| decode_err("port", e))?,
        proxy_type: proxy_type.parse::<ProxyScheme>().map_err(|e| decode_err("type", e))?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        is_active: row.try_get("is_active")?,
        failure_count: row.try_get("failure_count")?,
        last_checked: row.try_get("last_checked")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn not_found(entity: &'static str, id: i64) -> impl FnOnce(sqlx::Error) -> StorageError {
    move |e| match e {
        sqlx::Error::RowNotFound => StorageError::NotFound { entity, id },
        other => StorageError::Database(other),
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn create_task(&self, task: NewTask) -> Result<Task, StorageError> {
        let query = format!(
            "INSERT INTO tasks (name, url, type, status, config)
             VALUES ($1, $2, $3, 'pending', $4)
             RETURNING {}",
            TASK_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(&task.name)
            .bind(&task.url)
            .bind(task.task_type.as_str())
            .bind(&task.config)
            .fetch_one(&self.pool)
            .await?;

        Ok(task_from_row(&row)?)
    }

    async fn get_task(&self, id: i64) -> Result<Task, StorageError> {
        let query = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);

        let row = sqlx::query(&query)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found("task", id))?;

        Ok(task_from_row(&row)?)
    }

    async fn list_tasks(&self, limit: i64, offset: i64) -> Result<Vec<Task>, StorageError> {
        let query = format!(
            "SELECT {} FROM tasks ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2",
            TASK_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(task_from_row).collect::<Result<_, _>>()?)
    }

    async fn update_task(&self, task: &Task) -> Result<(), StorageError> {
        sqlx::query("UPDATE tasks SET name = $1, url = $2, config = $3, updated_at = NOW() WHERE id = $4")
            .bind(&task.name)
            .bind(&task.url)
            .bind(&task.config)
            .bind(task.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<(), StorageError> {
        let query = match status {
            TaskStatus::Running => {
                "UPDATE tasks SET status = $1, started_at = NOW(), updated_at = NOW() WHERE id = $2"
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                "UPDATE tasks SET status = $1, completed_at = NOW(), updated_at = NOW() WHERE id = $2"
            }
            _ => "UPDATE tasks SET status = $1, updated_at = NOW() WHERE id = $2",
        };

        let result = sqlx::query(query)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound { entity: "task", id });
        }

        Ok(())
    }

    async fn update_task_config(&self, id: i64, config: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE tasks SET config = $1, updated_at = NOW() WHERE id = $2")
            .bind(config)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn upsert_product(&self, record: &ProductRecord) -> Result<i64, StorageError> {
        let row = sqlx::query(
            "INSERT INTO products (
                external_id, product_id, name, brand, catalog, artist,
                rating, list_price, sale_price, in_stock, raw_data, status
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'pending')
             ON CONFLICT (external_id) DO UPDATE SET
                product_id = EXCLUDED.product_id,
                name = EXCLUDED.name,
                brand = EXCLUDED.brand,
                catalog = EXCLUDED.catalog,
                artist = EXCLUDED.artist,
                rating = EXCLUDED.rating,
                list_price = EXCLUDED.list_price,
                sale_price = EXCLUDED.sale_price,
                in_stock = EXCLUDED.in_stock,
                raw_data = EXCLUDED.raw_data,
                updated_at = NOW()
             RETURNING id",
        )
        .bind(&record.external_id)
        .bind(&record.product_id)
        .bind(&record.name)
        .bind(&record.brand)
        .bind(&record.catalog)
        .bind(&record.artist)
        .bind(record.rating)
        .bind(record.list_price)
        .bind(record.sale_price)
        .bind(record.in_stock)
        .bind(Json(&record.raw_data))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn count_products(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM products")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("total")?)
    }

    async fn get_payload_overrides(&self) -> Result<Value, StorageError> {
        let row = sqlx::query("SELECT value FROM crawler_settings WHERE settings_key = $1")
            .bind(PAYLOAD_OVERRIDES_KEY)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let Json(value): Json<Value> = row.try_get("value")?;
                Ok(if value.is_null() { json!({}) } else { value })
            }
            None => Ok(json!({})),
        }
    }

    async fn update_payload_overrides(&self, overrides: &Value) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO crawler_settings (settings_key, value, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (settings_key)
             DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(PAYLOAD_OVERRIDES_KEY)
        .bind(Json(overrides))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_proxy(&self, proxy: NewProxy) -> Result<Proxy, StorageError> {
        let query = format!(
            "INSERT INTO proxies (host, port, type, username, password)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            PROXY_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(&proxy.host)
            .bind(i32::from(proxy.port))
            .bind(proxy.proxy_type.as_str())
            .bind(&proxy.username)
            .bind(&proxy.password)
            .fetch_one(&self.pool)
            .await?;

        Ok(proxy_from_row(&row)?)
    }

    async fn list_proxies(&self) -> Result<Vec<Proxy>, StorageError> {
        let query = format!("SELECT {} FROM proxies ORDER BY id", PROXY_COLUMNS);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        Ok(rows.iter().map(proxy_from_row).collect::<Result<_, _>>()?)
    }

    async fn get_active_proxies(&self) -> Result<Vec<Proxy>, StorageError> {
        let query = format!(
            "SELECT {} FROM proxies
             WHERE is_active = true
             ORDER BY failure_count ASC, last_checked ASC NULLS FIRST",
            PROXY_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        Ok(rows.iter().map(proxy_from_row).collect::<Result<_, _>>()?)
    }

    async fn update_proxy_health(&self, id: i64, healthy: bool) -> Result<Proxy, StorageError> {
        let query = if healthy {
            format!(
                "UPDATE proxies
                 SET is_active = true, failure_count = 0, last_checked = NOW(), updated_at = NOW()
                 WHERE id = $1
                 RETURNING {}",
                PROXY_COLUMNS
            )
        } else {
            format!(
                "UPDATE proxies
                 SET failure_count = failure_count + 1, last_checked = NOW(), updated_at = NOW()
                 WHERE id = $1
                 RETURNING {}",
                PROXY_COLUMNS
            )
        };

        let row = sqlx::query(&query)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found("proxy", id))?;

        Ok(proxy_from_row(&row)?)
    }

    async fn set_proxy_active(&self, id: i64, active: bool) -> Result<(), StorageError> {
        sqlx::query("UPDATE proxies SET is_active = $1, updated_at = NOW() WHERE id = $2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_crawl_result(&self, result: NewCrawlResult) -> Result<i64, StorageError> {
        let row = sqlx::query(
            "INSERT INTO crawl_results (task_id, url, method, status_code, headers, body, response_time_ms, proxy_used)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(result.task_id)
        .bind(&result.url)
        .bind(&result.method)
        .bind(result.status_code)
        .bind(Json(&result.headers))
        .bind(&result.body)
        .bind(result.response_time_ms)
        .bind(&result.proxy_used)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }
}
