use std::net::IpAddr;

use sqlx::{Row, SqlitePool};

use layer7waf_common::{Layer7Error, Outcome, Refusal};
use layer7waf_ip_policy::{WhitelistEntry, WhitelistSnapshot, WhitelistType};

fn db_err(e: sqlx::Error) -> Layer7Error {
    Layer7Error::Database(e.to_string())
}

fn type_to_str(t: WhitelistType) -> &'static str {
    match t {
        WhitelistType::Manual => "manual",
        WhitelistType::AdminAuto => "admin_auto",
        WhitelistType::System => "system",
    }
}

fn type_from_str(s: &str) -> WhitelistType {
    match s {
        "admin_auto" => WhitelistType::AdminAuto,
        "system" => WhitelistType::System,
        _ => WhitelistType::Manual,
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<WhitelistEntry, Layer7Error> {
    let ip_address: Option<String> = row.try_get("ip_address").map_err(db_err)?;
    let ip_range: Option<String> = row.try_get("ip_range").map_err(db_err)?;

    Ok(WhitelistEntry {
        id: row.try_get("id").map_err(db_err)?,
        ip_address: ip_address.map(|s| s.parse()).transpose().map_err(|e| {
            Layer7Error::Database(format!("corrupt whitelist ip_address: {e}"))
        })?,
        ip_range: ip_range.map(|s| s.parse()).transpose().map_err(|e| {
            Layer7Error::Database(format!("corrupt whitelist ip_range: {e}"))
        })?,
        entry_type: type_from_str(&row.try_get::<String, _>("entry_type").map_err(db_err)?),
        priority: row.try_get("priority").map_err(db_err)?,
        reason: row.try_get("reason").map_err(db_err)?,
        added_by: row.try_get("added_by").map_err(db_err)?,
    })
}

pub struct NewWhitelistEntry {
    pub ip_address: Option<String>,
    pub ip_range: Option<String>,
    pub entry_type: WhitelistType,
    pub priority: i64,
    pub reason: String,
    pub added_by: Option<String>,
}

pub async fn create(pool: &SqlitePool, new: NewWhitelistEntry) -> Result<WhitelistEntry, Layer7Error> {
    if let Some(range) = new.ip_range.as_deref().and_then(|s| s.parse::<ipnet::IpNet>().ok()) {
        if range.prefix_len() == 0 {
            tracing::warn!(range = %range, "whitelist entry matches the entire address space");
        }
    }

    let id = sqlx::query(
        "INSERT INTO whitelist_entries (ip_address, ip_range, entry_type, priority, reason, added_by)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&new.ip_address)
    .bind(&new.ip_range)
    .bind(type_to_str(new.entry_type))
    .bind(new.priority)
    .bind(&new.reason)
    .bind(&new.added_by)
    .execute(pool)
    .await
    .map_err(db_err)?
    .last_insert_rowid();

    get(pool, id).await?.ok_or_else(|| Layer7Error::Database("whitelist entry vanished after insert".into()))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<WhitelistEntry>, Layer7Error> {
    let row = sqlx::query("SELECT * FROM whitelist_entries WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    row.as_ref().map(row_to_entry).transpose()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<WhitelistEntry>, Layer7Error> {
    let rows = sqlx::query("SELECT * FROM whitelist_entries")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.iter().map(row_to_entry).collect()
}

/// Delete a whitelist entry. `System` entries can never be removed through
/// the admin surface; callers get `Refused` instead of an error.
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<Outcome<()>, Layer7Error> {
    let Some(entry) = get(pool, id).await? else {
        return Ok(Outcome::Ok(()));
    };
    if entry.entry_type == WhitelistType::System {
        return Ok(Outcome::Refused(Refusal::SystemWhitelistEntry));
    }
    sqlx::query("DELETE FROM whitelist_entries WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(Outcome::Ok(()))
}

/// Spec §4.2 `AutoWhitelistAdmin`: on a successful admin login, whitelist
/// the logging-in IP so the admin UI itself is never banned by its own
/// traffic. Priority 50 sits below any manually curated entry (1-49) but
/// above nothing else, and the insert is skipped entirely if the IP
/// already matches an existing entry (manual, admin_auto, or system).
pub async fn auto_whitelist_admin(pool: &SqlitePool, ip: IpAddr, user_id: &str) -> Result<Option<WhitelistEntry>, Layer7Error> {
    let existing = list_all(pool).await?;
    if WhitelistSnapshot::new(existing).find_match(ip).is_some() {
        return Ok(None);
    }

    let entry = create(
        pool,
        NewWhitelistEntry {
            ip_address: Some(ip.to_string()),
            ip_range: None,
            entry_type: WhitelistType::AdminAuto,
            priority: 50,
            reason: format!("auto-whitelisted on admin login by {user_id}"),
            added_by: Some(user_id.to_string()),
        },
    )
    .await?;
    Ok(Some(entry))
}
