use anyhow::Context;
use surrealdb::{engine::any::connect, Surreal};

/// Database wrapper for the embedded SurrealDB.
#[derive(Clone)]
pub struct Db {
    inner: Surreal<surrealdb::engine::any::Any>,
}

impl Db {
    /// Connects to `db_url`; the Any engine picks the backend from the scheme
    /// (`surrealkv://<dir>` with the `kv-surrealkv` feature).
    pub async fn connect(db_url: &str) -> anyhow::Result<Self> {
        let db = connect(db_url)
            .await
            .with_context(|| format!("connecting to {db_url}"))?;
        db.use_ns("relay")
            .use_db("relay")
            .await
            .context("selecting surreal namespace/db")?;
        Ok(Self { inner: db })
    }

    pub fn inner(&self) -> &Surreal<surrealdb::engine::any::Any> {
        &self.inner
    }

    /// Applies the schema at startup.
    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        let schema = include_str!("../schema.surql");
        self.inner
            .query(schema)
            .await
            .context("applying schema")?
            .check()
            .context("schema statement failed")?;
        Ok(())
    }
}
