//! Role templates.
//!
//! System templates are seeded by the migration and protected from mutation
//! here rather than in handlers, so no caller can bypass the guard.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{encode_string_list, fmt_ts, parse_string_list, parse_ts, parse_uuid, DbError, Result};

#[derive(Debug, Clone, serde::Serialize)]
pub struct RoleTemplate {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub scopes: Vec<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type RoleRow = (String, String, String, String, i64, String, String);

fn row_to_role(row: RoleRow) -> Result<RoleTemplate> {
    Ok(RoleTemplate {
        id: parse_uuid(&row.0)?,
        name: row.1,
        display_name: row.2,
        scopes: parse_string_list(Some(row.3))?,
        is_system: row.4 != 0,
        created_at: parse_ts(&row.5)?,
        updated_at: parse_ts(&row.6)?,
    })
}

const ROLE_COLS: &str = "id, name, display_name, scopes, is_system, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct RbacRepository {
    pool: SqlitePool,
}

impl RbacRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, scopes))]
    pub async fn create_role(
        &self,
        name: &str,
        display_name: &str,
        scopes: &[String],
    ) -> Result<RoleTemplate> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO role_templates (id, name, display_name, scopes, is_system, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(display_name)
        .bind(encode_string_list(scopes))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "role template with this name already exists"))?;
        Ok(RoleTemplate {
            id,
            name: name.to_string(),
            display_name: display_name.to_string(),
            scopes: scopes.to_vec(),
            is_system: false,
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_role_by_id(&self, id: Uuid) -> Result<Option<RoleTemplate>> {
        let row: Option<RoleRow> = sqlx::query_as(&format!(
            "SELECT {ROLE_COLS} FROM role_templates WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_role).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_role_by_name(&self, name: &str) -> Result<Option<RoleTemplate>> {
        let row: Option<RoleRow> = sqlx::query_as(&format!(
            "SELECT {ROLE_COLS} FROM role_templates WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_role).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_roles(&self) -> Result<Vec<RoleTemplate>> {
        let rows: Vec<RoleRow> = sqlx::query_as(&format!(
            "SELECT {ROLE_COLS} FROM role_templates ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_role).collect()
    }

    #[tracing::instrument(skip(self, scopes))]
    pub async fn update_role(
        &self,
        id: Uuid,
        display_name: &str,
        scopes: &[String],
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE role_templates SET display_name = ?, scopes = ?, updated_at = ?
             WHERE id = ? AND is_system = 0",
        )
        .bind(display_name)
        .bind(encode_string_list(scopes))
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return match self.get_role_by_id(id).await? {
                Some(_) => Err(DbError::Conflict(
                    "system role templates cannot be modified".to_string(),
                )),
                None => Err(DbError::NotFound("role template not found".to_string())),
            };
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_role(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM role_templates WHERE id = ? AND is_system = 0")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return match self.get_role_by_id(id).await? {
                Some(_) => Err(DbError::Conflict(
                    "system role templates cannot be deleted".to_string(),
                )),
                None => Err(DbError::NotFound("role template not found".to_string())),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_system_roles_are_protected() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.rbac();
        let admin = repo.get_role_by_name("admin").await.unwrap().unwrap();
        assert!(admin.is_system);
        assert!(matches!(
            repo.delete_role(admin.id).await,
            Err(DbError::Conflict(_))
        ));
        assert!(matches!(
            repo.update_role(admin.id, "x", &[]).await,
            Err(DbError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_role_lifecycle() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.rbac();
        let role = repo
            .create_role("ops", "Operators", &["mirrors:manage".to_string()])
            .await
            .unwrap();
        repo.update_role(role.id, "Ops", &["mirrors:manage".to_string(), "mirrors:read".to_string()])
            .await
            .unwrap();
        let updated = repo.get_role_by_id(role.id).await.unwrap().unwrap();
        assert_eq!(updated.scopes.len(), 2);
        repo.delete_role(role.id).await.unwrap();
        assert!(repo.get_role_by_id(role.id).await.unwrap().is_none());
    }
}
