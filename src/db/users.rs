//! User accounts and OIDC identity reconciliation.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{fmt_ts, parse_ts, parse_uuid, DbError, Result};

#[derive(Debug, Clone, serde::Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub oidc_sub: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub oidc_sub: Option<String>,
}

/// One organization membership with its resolved role, as returned by
/// [`UserRepository::get_user_with_org_roles`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserOrgRole {
    pub organization_id: Uuid,
    pub organization_name: String,
    pub role_name: Option<String>,
    pub scopes: Vec<String>,
}

type UserRow = (String, String, String, Option<String>, String, String);

fn row_to_user(row: UserRow) -> Result<User> {
    Ok(User {
        id: parse_uuid(&row.0)?,
        email: row.1,
        name: row.2,
        oidc_sub: row.3,
        created_at: parse_ts(&row.4)?,
        updated_at: parse_ts(&row.5)?,
    })
}

const USER_COLS: &str = "id, email, name, oidc_sub, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, user))]
    pub async fn create_user(&self, user: &NewUser) -> Result<User> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, email, name, oidc_sub, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.oidc_sub)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "user with this email already exists"))?;

        Ok(User {
            id,
            email: user.email.clone(),
            name: user.name.clone(),
            oidc_sub: user.oidc_sub.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLS} FROM users WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_user).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLS} FROM users WHERE email = ?"))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_user).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_user_by_oidc_sub(&self, sub: &str) -> Result<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLS} FROM users WHERE oidc_sub = ?"))
                .bind(sub)
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_user).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLS} FROM users ORDER BY email"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(row_to_user).collect()
    }

    /// Resolve an OIDC login to a local user, creating or reconciling on
    /// first sight: match by subject first, then adopt an existing account
    /// with the same email, then create.
    #[tracing::instrument(skip(self))]
    pub async fn find_or_create_oidc_user(
        &self,
        sub: &str,
        email: &str,
        name: &str,
    ) -> Result<User> {
        if let Some(user) = self.get_user_by_oidc_sub(sub).await? {
            return Ok(user);
        }
        if let Some(user) = self.get_user_by_email(email).await? {
            sqlx::query("UPDATE users SET oidc_sub = ?, updated_at = ? WHERE id = ?")
                .bind(sub)
                .bind(fmt_ts(Utc::now()))
                .bind(user.id.to_string())
                .execute(&self.pool)
                .await?;
            return Ok(User {
                oidc_sub: Some(sub.to_string()),
                ..user
            });
        }
        self.create_user(&NewUser {
            email: email.to_string(),
            name: name.to_string(),
            oidc_sub: Some(sub.to_string()),
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_user(&self, id: Uuid, email: &str, name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE users SET email = ?, name = ?, updated_at = ? WHERE id = ?")
            .bind(email)
            .bind(name)
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::on_conflict(e, "user with this email already exists"))?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("user not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_user(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("user not found".to_string()));
        }
        Ok(())
    }

    /// Memberships with resolved role template, two joined queries instead
    /// of in-memory graph building.
    #[tracing::instrument(skip(self))]
    pub async fn get_user_with_org_roles(&self, user_id: Uuid) -> Result<Vec<UserOrgRole>> {
        let rows: Vec<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT o.id, o.name, rt.name, rt.scopes
             FROM organization_members m
             JOIN organizations o ON o.id = m.organization_id
             LEFT JOIN role_templates rt ON rt.id = m.role_template_id
             WHERE m.user_id = ?
             ORDER BY o.name",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(org_id, org_name, role_name, scopes)| {
                Ok(UserOrgRole {
                    organization_id: parse_uuid(&org_id)?,
                    organization_name: org_name,
                    role_name,
                    scopes: super::parse_string_list(scopes)?,
                })
            })
            .collect()
    }

    /// Union of scopes across every membership.
    #[tracing::instrument(skip(self))]
    pub async fn effective_scopes(&self, user_id: Uuid) -> Result<Vec<String>> {
        let roles = self.get_user_with_org_roles(user_id).await?;
        let mut scopes: Vec<String> = roles.into_iter().flat_map(|r| r.scopes).collect();
        scopes.sort();
        scopes.dedup();
        Ok(scopes)
    }

    // Terse aliases kept so handler code reads uniformly across repositories.

    pub async fn create(&self, user: &NewUser) -> Result<User> {
        self.create_user(user).await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.get_user_by_id(id).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.delete_user(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            name: "Test User".to_string(),
            oidc_sub: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.users();
        let user = repo.create(&new_user("a@example.com")).await.unwrap();
        let found = repo.get_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(found.email, "a@example.com");
        assert!(repo.get_user_by_email("b@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.users();
        repo.create(&new_user("a@example.com")).await.unwrap();
        let err = repo.create(&new_user("a@example.com")).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_oidc_reconciles_by_email() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.users();
        let existing = repo.create(&new_user("a@example.com")).await.unwrap();
        let adopted = repo
            .find_or_create_oidc_user("sub-123", "a@example.com", "A User")
            .await
            .unwrap();
        assert_eq!(adopted.id, existing.id);
        assert_eq!(adopted.oidc_sub.as_deref(), Some("sub-123"));

        let again = repo
            .find_or_create_oidc_user("sub-123", "a@example.com", "A User")
            .await
            .unwrap();
        assert_eq!(again.id, existing.id);

        let fresh = repo
            .find_or_create_oidc_user("sub-999", "new@example.com", "New User")
            .await
            .unwrap();
        assert_ne!(fresh.id, existing.id);
    }
}
