use sqlx::{Row, SqlitePool};

use layer7waf_common::Layer7Error;

use crate::crypto;
use crate::types::Integration;

fn db_err(e: sqlx::Error) -> Layer7Error {
    Layer7Error::Database(e.to_string())
}

fn row_to_integration(row: &sqlx::sqlite::SqliteRow) -> Result<Integration, Layer7Error> {
    Ok(Integration {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        provider: row.try_get("provider").map_err(db_err)?,
        enabled: row.try_get::<i64, _>("enabled").map_err(db_err)? != 0,
        credentials_encrypted: row.try_get("credentials_encrypted").map_err(db_err)?,
        scope: row.try_get("scope").map_err(db_err)?,
    })
}

pub struct NewIntegration {
    pub name: String,
    pub provider: String,
    pub enabled: bool,
    /// Plaintext credentials; encrypted at rest before the row is written.
    pub credentials: String,
    pub scope: Option<String>,
}

/// Spec §6: integration credentials are never stored in plaintext. Encryption
/// failure (most commonly a missing `LAYER7WAF_CREDENTIALS_KEY`) is fatal and
/// the row is never written.
pub async fn create(pool: &SqlitePool, new: NewIntegration) -> Result<Integration, Layer7Error> {
    let encrypted = crypto::encrypt(&new.credentials).map_err(|e| {
        Layer7Error::fatal(
            format!("failed to encrypt integration credentials: {e}"),
            "set LAYER7WAF_CREDENTIALS_KEY to a 32-byte hex key",
        )
    })?;

    let id = sqlx::query(
        "INSERT INTO integrations (name, provider, enabled, credentials_encrypted, scope)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&new.name)
    .bind(&new.provider)
    .bind(new.enabled as i64)
    .bind(&encrypted)
    .bind(&new.scope)
    .execute(pool)
    .await
    .map_err(db_err)?
    .last_insert_rowid();

    get(pool, id).await?.ok_or_else(|| Layer7Error::Database("integration vanished after insert".into()))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<Integration>, Layer7Error> {
    let row = sqlx::query("SELECT * FROM integrations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    row.as_ref().map(row_to_integration).transpose()
}

pub async fn list_enabled(pool: &SqlitePool) -> Result<Vec<Integration>, Layer7Error> {
    let rows = sqlx::query("SELECT * FROM integrations WHERE enabled = 1")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.iter().map(row_to_integration).collect()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Integration>, Layer7Error> {
    let rows = sqlx::query("SELECT * FROM integrations")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.iter().map(row_to_integration).collect()
}

/// Decrypt an integration's stored credentials for use by a firewall
/// provider client. Never logged; callers must not log the return value.
pub fn decrypt_credentials(integration: &Integration) -> Result<String, Layer7Error> {
    crypto::decrypt(&integration.credentials_encrypted)
        .map_err(|e| Layer7Error::fatal(format!("failed to decrypt integration credentials: {e}"), "verify LAYER7WAF_CREDENTIALS_KEY has not changed"))
}

pub async fn set_enabled(pool: &SqlitePool, id: i64, enabled: bool) -> Result<(), Layer7Error> {
    sqlx::query("UPDATE integrations SET enabled = ? WHERE id = ?")
        .bind(enabled as i64)
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: i64) -> Result<(), Layer7Error> {
    sqlx::query("DELETE FROM integrations WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_key<F: FnOnce()>(f: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(crypto::KEY_ENV_VAR, "0".repeat(64));
        f();
        std::env::remove_var(crypto::KEY_ENV_VAR);
    }

    #[tokio::test]
    async fn create_encrypts_and_roundtrips() {
        with_key(|| {});
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();
        std::env::set_var(crypto::KEY_ENV_VAR, "0".repeat(64));

        let integration = create(
            &pool,
            NewIntegration {
                name: "primary firewall".into(),
                provider: "firewall-a".into(),
                enabled: true,
                credentials: "api-key-super-secret".into(),
                scope: None,
            },
        )
        .await
        .unwrap();

        assert_ne!(integration.credentials_encrypted, "api-key-super-secret");
        let decrypted = decrypt_credentials(&integration).unwrap();
        assert_eq!(decrypted, "api-key-super-secret");

        std::env::remove_var(crypto::KEY_ENV_VAR);
    }

    #[tokio::test]
    async fn create_without_key_fails_loudly() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(crypto::KEY_ENV_VAR);

        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();

        let result = create(
            &pool,
            NewIntegration {
                name: "primary firewall".into(),
                provider: "firewall-a".into(),
                enabled: true,
                credentials: "api-key".into(),
                scope: None,
            },
        )
        .await;

        assert!(result.is_err());
        assert!(list_all(&pool).await.unwrap().is_empty());
    }
}
