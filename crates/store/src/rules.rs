use sqlx::{Row, SqlitePool};

use layer7waf_common::{BanSeverity, Layer7Error, SeverityFilter};

use crate::types::DetectionRule;

fn db_err(e: sqlx::Error) -> Layer7Error {
    Layer7Error::Database(e.to_string())
}

fn severity_filter_to_str(f: SeverityFilter) -> &'static str {
    match f {
        SeverityFilter::All => "ALL",
        SeverityFilter::Warning => "WARNING",
        SeverityFilter::Error => "ERROR",
        SeverityFilter::Critical => "CRITICAL",
    }
}

fn severity_filter_from_str(s: &str) -> SeverityFilter {
    match s {
        "WARNING" => SeverityFilter::Warning,
        "ERROR" => SeverityFilter::Error,
        "CRITICAL" => SeverityFilter::Critical,
        _ => SeverityFilter::All,
    }
}

fn ban_severity_to_str(s: BanSeverity) -> &'static str {
    match s {
        BanSeverity::Low => "LOW",
        BanSeverity::Medium => "MEDIUM",
        BanSeverity::High => "HIGH",
        BanSeverity::Critical => "CRITICAL",
    }
}

fn ban_severity_from_str(s: &str) -> BanSeverity {
    match s {
        "LOW" => BanSeverity::Low,
        "HIGH" => BanSeverity::High,
        "CRITICAL" => BanSeverity::Critical,
        _ => BanSeverity::Medium,
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<DetectionRule, Layer7Error> {
    let attack_types_raw: String = row.try_get("attack_types").map_err(db_err)?;
    Ok(DetectionRule {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        enabled: row.try_get::<i64, _>("enabled").map_err(db_err)? != 0,
        priority: row.try_get("priority").map_err(db_err)?,
        time_window_s: row.try_get("time_window_s").map_err(db_err)?,
        threshold: row.try_get("threshold").map_err(db_err)?,
        attack_types: serde_json::from_str(&attack_types_raw).unwrap_or_default(),
        severity_filter: severity_filter_from_str(&row.try_get::<String, _>("severity_filter").map_err(db_err)?),
        proxy_id: row.try_get("proxy_id").map_err(db_err)?,
        ban_duration_s: row.try_get("ban_duration_s").map_err(db_err)?,
        ban_severity: ban_severity_from_str(&row.try_get::<String, _>("ban_severity").map_err(db_err)?),
    })
}

pub struct NewDetectionRule {
    pub name: String,
    pub enabled: bool,
    pub priority: i64,
    pub time_window_s: i64,
    pub threshold: i64,
    pub attack_types: Vec<String>,
    pub severity_filter: SeverityFilter,
    pub proxy_id: Option<i64>,
    pub ban_duration_s: Option<i64>,
    pub ban_severity: BanSeverity,
}

pub async fn create(pool: &SqlitePool, new: NewDetectionRule) -> Result<DetectionRule, Layer7Error> {
    let attack_types = serde_json::to_string(&new.attack_types).unwrap();
    let id = sqlx::query(
        r#"INSERT INTO detection_rules
            (name, enabled, priority, time_window_s, threshold, attack_types, severity_filter,
             proxy_id, ban_duration_s, ban_severity)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&new.name)
    .bind(new.enabled as i64)
    .bind(new.priority)
    .bind(new.time_window_s)
    .bind(new.threshold)
    .bind(&attack_types)
    .bind(severity_filter_to_str(new.severity_filter))
    .bind(new.proxy_id)
    .bind(new.ban_duration_s)
    .bind(ban_severity_to_str(new.ban_severity))
    .execute(pool)
    .await
    .map_err(db_err)?
    .last_insert_rowid();

    get(pool, id).await?.ok_or_else(|| Layer7Error::Database("detection rule vanished after insert".into()))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<DetectionRule>, Layer7Error> {
    let row = sqlx::query("SELECT * FROM detection_rules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    row.as_ref().map(row_to_rule).transpose()
}

/// All enabled rules, ordered the way the detection engine must evaluate
/// them: ascending priority (spec §4.8 step 3).
pub async fn list_enabled_by_priority(pool: &SqlitePool) -> Result<Vec<DetectionRule>, Layer7Error> {
    let rows = sqlx::query("SELECT * FROM detection_rules WHERE enabled = 1 ORDER BY priority ASC")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.iter().map(row_to_rule).collect()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<DetectionRule>, Layer7Error> {
    let rows = sqlx::query("SELECT * FROM detection_rules ORDER BY priority ASC")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.iter().map(row_to_rule).collect()
}

pub async fn delete(pool: &SqlitePool, id: i64) -> Result<(), Layer7Error> {
    sqlx::query("DELETE FROM detection_rules WHERE id = ?")
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

    fn sample() -> NewDetectionRule {
        NewDetectionRule {
            name: "sqli burst".into(),
            enabled: true,
            priority: 10,
            time_window_s: 300,
            threshold: 5,
            attack_types: vec!["sqli".into()],
            severity_filter: SeverityFilter::Warning,
            proxy_id: None,
            ban_duration_s: Some(3600),
            ban_severity: BanSeverity::High,
        }
    }

    #[tokio::test]
    async fn create_and_list_ordered_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();

        let mut low_priority = sample();
        low_priority.name = "low priority".into();
        low_priority.priority = 50;
        create(&pool, low_priority).await.unwrap();

        let mut high_priority = sample();
        high_priority.name = "high priority".into();
        high_priority.priority = 1;
        create(&pool, high_priority).await.unwrap();

        let rules = list_enabled_by_priority(&pool).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "high priority");
        assert_eq!(rules[1].name, "low priority");
    }

    #[tokio::test]
    async fn disabled_rules_excluded_from_enabled_listing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("database.db")).await.unwrap();

        let mut disabled = sample();
        disabled.enabled = false;
        create(&pool, disabled).await.unwrap();

        let rules = list_enabled_by_priority(&pool).await.unwrap();
        assert!(rules.is_empty());
    }
}
