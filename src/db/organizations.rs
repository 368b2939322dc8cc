//! Organizations and membership management.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_uuid, parse_ts, parse_uuid, DbError, Result};

#[derive(Debug, Clone, serde::Serialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrganizationMember {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub role_template_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

type OrgRow = (String, String, String, String, String);

fn row_to_org(row: OrgRow) -> Result<Organization> {
    Ok(Organization {
        id: parse_uuid(&row.0)?,
        name: row.1,
        display_name: row.2,
        created_at: parse_ts(&row.3)?,
        updated_at: parse_ts(&row.4)?,
    })
}

const ORG_COLS: &str = "id, name, display_name, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct OrganizationRepository {
    pool: SqlitePool,
}

impl OrganizationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_organization(&self, name: &str, display_name: &str) -> Result<Organization> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO organizations (id, name, display_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(display_name)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "organization with this name already exists"))?;
        Ok(Organization {
            id,
            name: name.to_string(),
            display_name: display_name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Organization>> {
        let row: Option<OrgRow> =
            sqlx::query_as(&format!("SELECT {ORG_COLS} FROM organizations WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_org).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Organization>> {
        let row: Option<OrgRow> = sqlx::query_as(&format!(
            "SELECT {ORG_COLS} FROM organizations WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_org).transpose()
    }

    /// The synthetic single-tenant organization, seeded by the migration.
    pub async fn default_org(&self) -> Result<Organization> {
        self.get_by_name(crate::constants::DEFAULT_ORGANIZATION)
            .await?
            .ok_or_else(|| DbError::Internal("default organization missing".to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Organization>> {
        let rows: Vec<OrgRow> =
            sqlx::query_as(&format!("SELECT {ORG_COLS} FROM organizations ORDER BY name"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(row_to_org).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn update(&self, id: Uuid, display_name: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE organizations SET display_name = ?, updated_at = ? WHERE id = ?")
                .bind(display_name)
                .bind(fmt_ts(Utc::now()))
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("organization not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM organizations WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("organization not found".to_string()));
        }
        Ok(())
    }

    /// Add or update a membership; the role is replaced on conflict.
    #[tracing::instrument(skip(self))]
    pub async fn add_member(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        role_template_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO organization_members (organization_id, user_id, role_template_id, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(organization_id, user_id) DO UPDATE SET role_template_id = excluded.role_template_id",
        )
        .bind(organization_id.to_string())
        .bind(user_id.to_string())
        .bind(role_template_id.map(|id| id.to_string()))
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_member(&self, organization_id: Uuid, user_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM organization_members WHERE organization_id = ? AND user_id = ?",
        )
        .bind(organization_id.to_string())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("membership not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_members(&self, organization_id: Uuid) -> Result<Vec<OrganizationMember>> {
        let rows: Vec<(String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT organization_id, user_id, role_template_id, created_at
             FROM organization_members WHERE organization_id = ? ORDER BY created_at",
        )
        .bind(organization_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(org, user, role, created)| {
                Ok(OrganizationMember {
                    organization_id: parse_uuid(&org)?,
                    user_id: parse_uuid(&user)?,
                    role_template_id: parse_opt_uuid(role)?,
                    created_at: parse_ts(&created)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::users::NewUser;
    use crate::db::Database;

    #[tokio::test]
    async fn test_membership_role_replaced_on_conflict() {
        let db = Database::in_memory().await.unwrap();
        let orgs = db.organizations();
        let org = orgs.create_organization("acme", "Acme").await.unwrap();
        let user = db
            .users()
            .create(&NewUser {
                email: "a@acme.io".to_string(),
                name: "A".to_string(),
                oidc_sub: None,
            })
            .await
            .unwrap();

        orgs.add_member(org.id, user.id, None).await.unwrap();
        let role = db.rbac().get_role_by_name("viewer").await.unwrap().unwrap();
        orgs.add_member(org.id, user.id, Some(role.id)).await.unwrap();

        let members = orgs.list_members(org.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role_template_id, Some(role.id));
    }
}
