use std::collections::BTreeSet;

use anyhow::{bail, Result};

use super::{
    insert_audit, new_id, now, ApiKeyRecord, AuditLogRecord, DbClient, FeatureFlagRecord,
    MembershipRecord, NewAuditLog, NewUser, OrganizationRecord, Page, PermissionRecord,
    RoleRecord, UserRecord,
};

pub const GLOBAL_ADMIN_ROLE_ID: &str = "role-admin";

/// Roles and permission pairs a user holds inside one organization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EffectivePermissions {
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<(String, String)>,
}

impl DbClient {
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn users_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE deleted_at IS NULL")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// # Errors
    /// Returns an error if the insert fails, including duplicate usernames.
    pub async fn insert_user(&self, user: &NewUser) -> Result<()> {
        let now = now();
        sqlx::query(
            "INSERT INTO users (id, external_id, email, username, password_hash, user_type, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        )
        .bind(&user.id)
        .bind(&user.external_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.user_type.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let user = sqlx::query_as::<_, UserRecord>(
            "SELECT id, external_id, email, username, password_hash, user_type, created_at FROM users WHERE username = ?1 AND deleted_at IS NULL",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<UserRecord>> {
        let user = sqlx::query_as::<_, UserRecord>(
            "SELECT id, external_id, email, username, password_hash, user_type, created_at FROM users WHERE external_id = ?1 AND deleted_at IS NULL",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let user = sqlx::query_as::<_, UserRecord>(
            "SELECT id, external_id, email, username, password_hash, user_type, created_at FROM users WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Soft-deletes a user. Refused while any membership is active.
    ///
    /// # Errors
    /// Returns an error if memberships exist or the update fails.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let memberships = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM organization_users WHERE user_id = ?1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        if memberships > 0 {
            bail!("user still belongs to {memberships} organization(s)");
        }

        sqlx::query("UPDATE users SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Creates an organization and makes the creator its admin.
    ///
    /// # Errors
    /// Returns an error if the slug is taken or a write fails.
    pub async fn create_organization(
        &self,
        name: &str,
        slug: &str,
        description: &str,
        creator_user_id: &str,
    ) -> Result<OrganizationRecord> {
        let organization_id = new_id();
        let now = now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO organizations (id, name, slug, description, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(&organization_id)
        .bind(name)
        .bind(slug)
        .bind(description)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO organization_users (id, organization_id, user_id, role_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(new_id())
        .bind(&organization_id)
        .bind(creator_user_id)
        .bind(GLOBAL_ADMIN_ROLE_ID)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_audit(
            &mut tx,
            &NewAuditLog {
                actor_user_id: creator_user_id.to_string(),
                organization_id: organization_id.clone(),
                resource: "organization".to_string(),
                action: "create".to_string(),
                target_id: Some(organization_id.clone()),
                payload_snapshot: serde_json::json!({ "name": name, "slug": slug }),
            },
        )
        .await?;

        let organization = sqlx::query_as::<_, OrganizationRecord>(
            "SELECT id, name, slug, description, created_at FROM organizations WHERE id = ?1",
        )
        .bind(&organization_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(organization)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_organization(&self, organization_id: &str) -> Result<Option<OrganizationRecord>> {
        let organization = sqlx::query_as::<_, OrganizationRecord>(
            "SELECT id, name, slug, description, created_at FROM organizations WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(organization)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_organizations_for_user(&self, user_id: &str) -> Result<Vec<OrganizationRecord>> {
        let organizations = sqlx::query_as::<_, OrganizationRecord>(
            "SELECT o.id, o.name, o.slug, o.description, o.created_at FROM organizations o
             JOIN organization_users ou ON ou.organization_id = o.id AND ou.deleted_at IS NULL
             WHERE ou.user_id = ?1 AND o.deleted_at IS NULL
             ORDER BY ou.created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(organizations)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn default_organization_for_user(&self, user_id: &str) -> Result<Option<String>> {
        let organization_id = sqlx::query_scalar::<_, String>(
            "SELECT organization_id FROM organization_users WHERE user_id = ?1 AND deleted_at IS NULL ORDER BY created_at ASC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(organization_id)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_memberships_for_user(&self, user_id: &str) -> Result<Vec<MembershipRecord>> {
        let memberships = sqlx::query_as::<_, MembershipRecord>(
            "SELECT ou.id, ou.organization_id, ou.user_id, ou.role_id, r.name AS role_name
             FROM organization_users ou JOIN roles r ON r.id = ou.role_id
             WHERE ou.user_id = ?1 AND ou.deleted_at IS NULL
             ORDER BY ou.created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(memberships)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn is_member(&self, organization_id: &str, user_id: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM organization_users WHERE organization_id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// # Errors
    /// Returns an error if the user is already a member or a write fails.
    pub async fn add_member(
        &self,
        organization_id: &str,
        user_id: &str,
        role_id: &str,
        audit: &NewAuditLog,
    ) -> Result<String> {
        let membership_id = new_id();
        let now = now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO organization_users (id, organization_id, user_id, role_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(&membership_id)
        .bind(organization_id)
        .bind(user_id)
        .bind(role_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(membership_id)
    }

    /// Returns whether an active membership was removed.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn remove_member(
        &self,
        organization_id: &str,
        user_id: &str,
        audit: &NewAuditLog,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE organization_users SET deleted_at = ?3, updated_at = ?3 WHERE organization_id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
        )
        .bind(organization_id)
        .bind(user_id)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Global defaults plus roles scoped to the organization.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_roles(&self, organization_id: &str) -> Result<Vec<RoleRecord>> {
        let roles = sqlx::query_as::<_, RoleRecord>(
            "SELECT id, name, description, organization_id FROM roles
             WHERE deleted_at IS NULL AND (organization_id IS NULL OR organization_id = ?1)
             ORDER BY organization_id IS NOT NULL, name",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(roles)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_role(&self, role_id: &str) -> Result<Option<RoleRecord>> {
        let role = sqlx::query_as::<_, RoleRecord>(
            "SELECT id, name, description, organization_id FROM roles WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(role)
    }

    /// Creates `orgid_<organization>_<name>`.
    ///
    /// # Errors
    /// Returns an error if the name is taken or a write fails.
    pub async fn create_role(
        &self,
        organization_id: &str,
        name: &str,
        description: &str,
        audit: &NewAuditLog,
    ) -> Result<RoleRecord> {
        let role = RoleRecord {
            id: new_id(),
            name: format!("orgid_{organization_id}_{name}"),
            description: description.to_string(),
            organization_id: Some(organization_id.to_string()),
        };
        let now = now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO roles (id, name, description, organization_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(&role.id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(organization_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(role)
    }

    /// Soft-deletes an organization-scoped role. Global roles are never touched.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn delete_role(
        &self,
        organization_id: &str,
        role_id: &str,
        audit: &NewAuditLog,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE roles SET deleted_at = ?3, updated_at = ?3 WHERE id = ?1 AND organization_id = ?2 AND deleted_at IS NULL",
        )
        .bind(role_id)
        .bind(organization_id)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// # Errors
    /// Returns an error if the permission is unknown or a write fails.
    pub async fn grant_permission(
        &self,
        role_id: &str,
        resource: &str,
        action: &str,
        audit: &NewAuditLog,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let permission_id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM permissions WHERE resource = ?1 AND action = ?2",
        )
        .bind(resource)
        .bind(action)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(permission_id) = permission_id else {
            bail!("unknown permission {resource}:{action}");
        };

        sqlx::query(
            "INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?1, ?2)",
        )
        .bind(role_id)
        .bind(&permission_id)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn revoke_permission(
        &self,
        role_id: &str,
        resource: &str,
        action: &str,
        audit: &NewAuditLog,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "DELETE FROM role_permissions WHERE role_id = ?1 AND permission_id = (SELECT id FROM permissions WHERE resource = ?2 AND action = ?3)",
        )
        .bind(role_id)
        .bind(resource)
        .bind(action)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn role_permissions(&self, role_id: &str) -> Result<Vec<PermissionRecord>> {
        let permissions = sqlx::query_as::<_, PermissionRecord>(
            "SELECT p.id, p.resource, p.action FROM permissions p
             JOIN role_permissions rp ON rp.permission_id = p.id
             WHERE rp.role_id = ?1 ORDER BY p.resource, p.action",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(permissions)
    }

    /// Union of permissions from global default roles held through a
    /// membership in the organization and from `orgid_<organization>_` roles
    /// held through any membership.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn effective_permissions(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<EffectivePermissions> {
        let scoped_prefix = format!("orgid_{organization_id}_");
        let rows = sqlx::query_as::<_, (String, Option<String>, Option<String>)>(
            "SELECT r.name, p.resource, p.action
             FROM organization_users ou
             JOIN roles r ON r.id = ou.role_id AND r.deleted_at IS NULL
             LEFT JOIN role_permissions rp ON rp.role_id = r.id
             LEFT JOIN permissions p ON p.id = rp.permission_id
             WHERE ou.user_id = ?1 AND ou.deleted_at IS NULL
               AND ((r.organization_id IS NULL AND ou.organization_id = ?2)
                    OR substr(r.name, 1, length(?3)) = ?3)",
        )
        .bind(user_id)
        .bind(organization_id)
        .bind(&scoped_prefix)
        .fetch_all(&self.pool)
        .await?;

        let mut effective = EffectivePermissions::default();
        for (role_name, resource, action) in rows {
            effective.roles.insert(role_name);
            if let (Some(resource), Some(action)) = (resource, action) {
                effective.permissions.insert((resource, action));
            }
        }

        Ok(effective)
    }

    /// # Errors
    /// Returns an error if the prefix already exists or a write fails.
    pub async fn insert_api_key(&self, key: &ApiKeyRecord, audit: &NewAuditLog) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO api_keys (id, user_id, organization_id, prefix, hashed_secret, label, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        )
        .bind(&key.id)
        .bind(&key.user_id)
        .bind(&key.organization_id)
        .bind(&key.prefix)
        .bind(&key.hashed_secret)
        .bind(&key.label)
        .bind(super::timestamp(key.created_at))
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Active (not revoked, not deleted) key with this prefix.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn find_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKeyRecord>> {
        let key = sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT id, user_id, organization_id, prefix, hashed_secret, label, last_used_at, revoked_at, created_at
             FROM api_keys WHERE prefix = ?1 AND revoked_at IS NULL AND deleted_at IS NULL",
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_api_keys(&self, organization_id: &str, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let keys = sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT id, user_id, organization_id, prefix, hashed_secret, label, last_used_at, revoked_at, created_at
             FROM api_keys WHERE organization_id = ?1 AND user_id = ?2 AND deleted_at IS NULL
             ORDER BY created_at DESC",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn revoke_api_key(
        &self,
        organization_id: &str,
        key_id: &str,
        audit: &NewAuditLog,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = ?3, updated_at = ?3 WHERE id = ?1 AND organization_id = ?2 AND revoked_at IS NULL",
        )
        .bind(key_id)
        .bind(organization_id)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn touch_api_key(&self, key_id: &str) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1")
            .bind(key_id)
            .bind(now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_feature_flags(&self, organization_id: &str) -> Result<Vec<FeatureFlagRecord>> {
        let flags = sqlx::query_as::<_, FeatureFlagRecord>(
            "SELECT organization_id, feature_name, enabled FROM feature_flags WHERE organization_id = ?1 ORDER BY feature_name",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(flags)
    }

    /// Features without a row are enabled.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn is_feature_enabled(&self, organization_id: &str, feature_name: &str) -> Result<bool> {
        let enabled = sqlx::query_scalar::<_, bool>(
            "SELECT enabled FROM feature_flags WHERE organization_id = ?1 AND feature_name = ?2",
        )
        .bind(organization_id)
        .bind(feature_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(enabled.unwrap_or(true))
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn set_feature_flag(
        &self,
        organization_id: &str,
        feature_name: &str,
        enabled: bool,
        audit: &NewAuditLog,
    ) -> Result<()> {
        let now = now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO feature_flags (organization_id, feature_name, enabled, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(organization_id, feature_name) DO UPDATE SET enabled = excluded.enabled, updated_at = excluded.updated_at",
        )
        .bind(organization_id)
        .bind(feature_name)
        .bind(enabled)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_audit_logs(&self, organization_id: &str, page: Page) -> Result<Vec<AuditLogRecord>> {
        let logs = sqlx::query_as::<_, AuditLogRecord>(
            "SELECT id, actor_user_id, organization_id, resource, action, target_id, payload_snapshot, timestamp
             FROM audit_logs WHERE organization_id = ?1
             ORDER BY timestamp DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(organization_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_audit_logs(&self, organization_id: &str, resource: &str, action: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM audit_logs WHERE organization_id = ?1 AND resource = ?2 AND action = ?3",
        )
        .bind(organization_id)
        .bind(resource)
        .bind(action)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
