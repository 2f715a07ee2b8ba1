pub mod schema;
use std::sync::Arc;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

#[derive(Clone)]
pub struct Db {
    pub pool: Arc<AnyPool>,
}

impl Db {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }
}

/// Shared test helper: a fresh, isolated in-memory sqlite pool with the schema applied.
/// Unique per call (shared-cache name keyed on a uuid) so parallel `#[tokio::test]`s never
/// collide on the same in-memory database.
#[cfg(test)]
pub async fn test_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    let db_name = uuid::Uuid::new_v4().to_string();
    let conn_str = format!("sqlite:file:{db_name}?mode=memory&cache=shared");
    let pool = AnyPoolOptions::new()
        .max_connections(5)
        .connect(&conn_str)
        .await
        .expect("connect in-memory sqlite pool");
    schema::migrate(&pool).await.expect("apply schema");
    pool
}
