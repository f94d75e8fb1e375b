use std::collections::HashSet;
use std::path::{Path, PathBuf};

use deadpool_postgres::Pool;

use super::error::DbError;

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    id SERIAL PRIMARY KEY,
    name VARCHAR(255) NOT NULL UNIQUE,
    applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub name: String,
    pub path: PathBuf,
}

/// `*.sql` files in `dir` missing from `applied`, in file-name order.
pub fn pending(dir: &Path, applied: &HashSet<String>) -> Result<Vec<Migration>, DbError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut migrations: Vec<Migration> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.extension().is_some_and(|x| x == "sql"))
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_string();
            (!applied.contains(&name)).then_some(Migration { name, path })
        })
        .collect();
    migrations.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(migrations)
}

/// Apply pending migrations, each in its own transaction together with its
/// ledger row.
pub async fn run(pool: &Pool, dir: &Path) -> Result<(), DbError> {
    let client = pool.get().await?;
    client.execute(LEDGER_DDL, &[]).await?;
    let rows = client.query("SELECT name FROM _migrations", &[]).await?;
    let applied: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();
    drop(client);

    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "Migrations directory not found, skipping migrations");
        return Ok(());
    }

    let migrations = pending(dir, &applied)?;
    for migration in &migrations {
        let sql = std::fs::read_to_string(&migration.path)?;

        let mut client = pool.get().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&sql).await.map_err(|e| {
            DbError::MigrationError(format!("Failed to run migration {}: {}", migration.name, e))
        })?;
        tx.execute("INSERT INTO _migrations (name) VALUES ($1)", &[&migration.name])
            .await?;
        tx.commit().await?;

        tracing::info!("Applied migration: {}", migration.name);
    }

    tracing::info!(applied = migrations.len(), "All migrations up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_skips_applied_and_non_sql() {
        let dir = std::env::temp_dir().join(format!("scan-migrations-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["002_records.sql", "001_tasks.sql", "003_flags.sql", "README.md"] {
            std::fs::write(dir.join(name), "SELECT 1;").unwrap();
        }

        let applied: HashSet<String> = ["002_records.sql".to_string()].into_iter().collect();
        let names: Vec<String> = pending(&dir, &applied)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["001_tasks.sql", "003_flags.sql"]);

        assert!(pending(&dir.join("missing"), &applied).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
