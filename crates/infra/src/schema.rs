//! Startup check that the tables the repository touches have the columns it
//! reads and writes. Migrations are applied out of band (`migrations/`).

use std::collections::HashSet;

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

pub const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "users",
        &["id", "is_blacklisted", "blacklisted_at", "blacklist_reason", "denial_count", "is_deleted"],
    ),
    (
        "ticket_tiers",
        &["id", "code", "stock", "price", "is_active", "is_deleted"],
    ),
    (
        "user_tickets",
        &[
            "id",
            "user_id",
            "tier_id",
            "sequence_number",
            "reference_code",
            "status",
            "con_badge_name",
            "badge_image",
            "is_fursuiter",
            "is_fursuit_staff",
            "denial_reason",
            "approved_at",
            "approved_by",
            "denied_at",
            "denied_by",
            "previous_tier_id",
            "previous_reference_code",
            "is_deleted",
            "created_at",
            "updated_at",
        ],
    ),
];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("database schema is missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("schema query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fails with every missing `table.column` at once.
pub async fn verify(pool: &PgPool) -> Result<(), SchemaError> {
    let tables: Vec<String> = REQUIRED_COLUMNS.iter().map(|(t, _)| t.to_string()).collect();
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT table_name::text, column_name::text FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = ANY($1)",
    )
    .bind(&tables)
    .fetch_all(pool)
    .await?;

    let present: HashSet<(String, String)> = rows.into_iter().collect();
    let missing = missing_columns(&present);
    if !missing.is_empty() {
        return Err(SchemaError::MissingColumns(missing));
    }
    info!(tables = tables.len(), "database schema verified");
    Ok(())
}

fn missing_columns(present: &HashSet<(String, String)>) -> Vec<String> {
    REQUIRED_COLUMNS
        .iter()
        .flat_map(|(table, columns)| columns.iter().map(move |c| (*table, *c)))
        .filter(|(t, c)| !present.contains(&(t.to_string(), c.to_string())))
        .map(|(t, c)| format!("{t}.{c}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_present() -> HashSet<(String, String)> {
        REQUIRED_COLUMNS
            .iter()
            .flat_map(|(t, cs)| cs.iter().map(move |c| (t.to_string(), c.to_string())))
            .collect()
    }

    #[test]
    fn complete_schema_has_nothing_missing() {
        assert!(missing_columns(&all_present()).is_empty());
    }

    #[test]
    fn reports_each_missing_column() {
        let mut present = all_present();
        present.remove(&("users".to_string(), "denial_count".to_string()));
        present.remove(&("user_tickets".to_string(), "previous_tier_id".to_string()));

        assert_eq!(
            missing_columns(&present),
            vec!["users.denial_count".to_string(), "user_tickets.previous_tier_id".to_string()]
        );
    }
}
