//! Sqlite-backed store for authored container records.

use std::path::Path;

use chrono::Utc;
use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tokio::fs;

use crate::{config::ContainerSpec, NestcoreError, NestcoreResult};

use super::Machine;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static MIGRATOR: Migrator = sqlx::migrate!("lib/management/migrations");

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Persistent store for the authored part of container records.
#[derive(Debug, Clone)]
pub struct MachineStore {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineStore {
    /// Opens (creating and migrating if needed) the store at `db_path`.
    pub async fn open(db_path: &Path) -> NestcoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await?;

        MIGRATOR.run(&pool).await.map_err(NestcoreError::custom)?;

        Ok(Self { pool })
    }

    /// Persists the authored record for a freshly provisioned container.
    pub async fn save(&self, spec: &ContainerSpec) -> NestcoreResult<Machine> {
        let machine = Machine {
            name: spec.get_name().clone(),
            distro: spec.get_distro().clone(),
            cpu_quota_percent: *spec.get_cpu_quota_percent() as i64,
            memory_mb: *spec.get_memory_mb() as i64,
            disk_gb: *spec.get_disk_gb() as i64,
            enable_ssh: *spec.get_enable_ssh(),
            ipv6_mode: spec.get_ipv6().as_str().to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO machines
                (name, distro, cpu_quota_percent, memory_mb, disk_gb, enable_ssh, ipv6_mode, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&machine.name)
        .bind(&machine.distro)
        .bind(machine.cpu_quota_percent)
        .bind(machine.memory_mb)
        .bind(machine.disk_gb)
        .bind(machine.enable_ssh)
        .bind(&machine.ipv6_mode)
        .bind(machine.created_at)
        .execute(&self.pool)
        .await?;

        Ok(machine)
    }

    /// Fetches the authored record for one container.
    pub async fn get(&self, name: &str) -> NestcoreResult<Option<Machine>> {
        let machine = sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(machine)
    }

    /// Lists all authored records.
    pub async fn list(&self) -> NestcoreResult<Vec<Machine>> {
        let machines = sqlx::query_as::<_, Machine>("SELECT * FROM machines ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(machines)
    }

    /// Removes the authored record for one container. Missing rows are fine.
    pub async fn remove(&self, name: &str) -> NestcoreResult<()> {
        sqlx::query("DELETE FROM machines WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
