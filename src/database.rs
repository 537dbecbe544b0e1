//! Database layer
//!
//! PostgreSQL persistence for the panel. `Database` implements the
//! [`Registry`] contract the ledger, monitor and reconciler run against, and
//! exposes the CRUD the HTTP handlers need. Every operation that touches more
//! than one row runs in a single transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};
use std::time::Duration as StdDuration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    models::*,
    registry::{CounterOverflow, Registry},
};

/// SQLSTATE raised when BIGINT arithmetic overflows
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

/// Reports BIGINT overflow as [`CounterOverflow`] so callers can tell it
/// apart from other database failures
fn counter_error(err: sqlx::Error, context: &'static str) -> anyhow::Error {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(NUMERIC_VALUE_OUT_OF_RANGE) => {
            anyhow::Error::new(CounterOverflow).context(context)
        }
        _ => anyhow::Error::new(err).context(context),
    }
}

/// Result of a guarded delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// Refused, with the reason shown to the caller
    InUse(String),
}

/// What `expire_packages` changed
#[derive(Debug, Clone, Default)]
pub struct ExpiryReport {
    pub expired: u64,
    /// Users moved back to the default group
    pub reverted_users: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct SeedReport {
    pub admin_created: bool,
    pub default_group_created: bool,
    pub packages_created: u64,
}

/// Default packages: name, description, max tunnels, max traffic in GiB
const DEFAULT_PACKAGES: [(&str, &str, i32, i64); 3] = [
    ("basic", "Basic package", 5, 5),
    ("standard", "Standard package", 10, 20),
    ("premium", "Premium package", 20, 100),
];

const GIB: i64 = 1024 * 1024 * 1024;
const DEFAULT_PACKAGE_DAYS: i32 = 30;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Creates a new database connection pool
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(StdDuration::from_secs(30))
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        info!("Connected to database with {} max connections", max_connections);
        Ok(Self { pool })
    }

    /// Runs pending migrations from `migrations/`
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>> {
        self.pool.begin().await.context("Failed to begin transaction")
    }

    // === Users ===

    pub async fn create_user(&self, new_user: NewUser) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, username, email, password_hash, is_admin, is_active, user_group_id)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6)
            RETURNING id, username, email, password_hash, real_name, phone, is_admin, is_active,
                      user_group_id, total_traffic, created_at, updated_at, last_login
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.password_hash)
        .bind(new_user.is_admin)
        .bind(new_user.user_group_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create user")?;

        info!(user_id = %user.id, username = %user.username, "user created");
        Ok(user)
    }

    pub async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, real_name, phone, is_admin, is_active,
                   user_group_id, total_traffic, created_at, updated_at, last_login
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get user by ID")?;

        Ok(user)
    }

    /// Looks an account up by username or email, as typed at login
    pub async fn get_user_by_login(&self, login: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, real_name, phone, is_admin, is_active,
                   user_group_id, total_traffic, created_at, updated_at, last_login
            FROM users WHERE username = $1 OR lower(email) = lower($1)
            LIMIT 1
            "#,
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get user by login")?;

        Ok(user)
    }

    /// Returns whether the username and the email are already taken
    pub async fn account_exists(&self, username: &str, email: &str) -> Result<(bool, bool)> {
        let row = sqlx::query(
            r#"
            SELECT
                EXISTS(SELECT 1 FROM users WHERE username = $1) AS username_taken,
                EXISTS(SELECT 1 FROM users WHERE lower(email) = lower($2)) AS email_taken
            "#,
        )
        .bind(username)
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check existing accounts")?;

        Ok((row.get("username_taken"), row.get("email_taken")))
    }

    pub async fn list_users(&self, pagination: &Pagination) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, real_name, phone, is_admin, is_active,
                   user_group_id, total_traffic, created_at, updated_at, last_login
            FROM users
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(pagination.limit_or(50, 200))
        .bind(pagination.offset())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list users")?;

        Ok(users)
    }

    /// Admin update of account flags
    pub async fn update_user(&self, user_id: Uuid, request: &UpdateUserRequest) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                is_active = COALESCE($2, is_active),
                is_admin = COALESCE($3, is_admin),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, username, email, password_hash, real_name, phone, is_admin, is_active,
                      user_group_id, total_traffic, created_at, updated_at, last_login
            "#,
        )
        .bind(user_id)
        .bind(request.is_active)
        .bind(request.is_admin)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update user")?;

        Ok(user)
    }

    pub async fn update_profile(&self, user_id: Uuid, request: &UpdateProfileRequest) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                real_name = COALESCE($2, real_name),
                phone = COALESCE($3, phone),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, username, email, password_hash, real_name, phone, is_admin, is_active,
                      user_group_id, total_traffic, created_at, updated_at, last_login
            "#,
        )
        .bind(user_id)
        .bind(&request.real_name)
        .bind(&request.phone)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update profile")?;

        Ok(user)
    }

    pub async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .context("Failed to update password")?;
        Ok(())
    }

    pub async fn record_login(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to record login")?;
        Ok(())
    }

    /// Moves a user to `group_id`; `None` falls back to the default group
    pub async fn assign_user_group(&self, user_id: Uuid, group_id: Option<Uuid>) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET user_group_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, username, email, password_hash, real_name, phone, is_admin, is_active,
                      user_group_id, total_traffic, created_at, updated_at, last_login
            "#,
        )
        .bind(user_id)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to assign user group")?;

        if let Some(user) = &user {
            info!(user_id = %user.id, group_id = ?group_id, "user group reassigned");
        }
        Ok(user)
    }

    // === User groups ===

    pub async fn list_groups(&self) -> Result<Vec<UserGroupWithCount>> {
        let groups = sqlx::query_as::<_, UserGroupWithCount>(
            r#"
            SELECT g.id, g.name, g.description, g.max_tunnels, g.max_traffic, g.upload_limit,
                   g.download_limit, g.is_default, g.package_id, g.created_at, g.updated_at,
                   COUNT(u.id) AS user_count
            FROM user_groups g
            LEFT JOIN users u ON u.user_group_id = g.id
            GROUP BY g.id
            ORDER BY g.is_default DESC, g.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list user groups")?;

        Ok(groups)
    }

    pub async fn get_group_by_id(&self, group_id: Uuid) -> Result<Option<UserGroup>> {
        let group = sqlx::query_as::<_, UserGroup>(
            r#"
            SELECT id, name, description, max_tunnels, max_traffic, upload_limit, download_limit,
                   is_default, package_id, created_at, updated_at
            FROM user_groups WHERE id = $1
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get user group")?;

        Ok(group)
    }

    pub async fn group_name_taken(&self, name: &str, excluding: Option<Uuid>) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM user_groups WHERE name = $1 AND ($2::uuid IS NULL OR id <> $2))",
        )
        .bind(name)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check group name")?;
        Ok(taken)
    }

    async fn clear_default_flag(tx: &mut Transaction<'_, Postgres>, keep: Option<Uuid>) -> Result<()> {
        sqlx::query(
            "UPDATE user_groups SET is_default = FALSE, updated_at = NOW() WHERE is_default AND ($1::uuid IS NULL OR id <> $1)",
        )
        .bind(keep)
        .execute(&mut **tx)
        .await
        .context("Failed to clear default group flag")?;
        Ok(())
    }

    /// Creates a group. Flagging it default unsets the flag elsewhere in the same transaction.
    pub async fn create_group(&self, request: &CreateGroupRequest) -> Result<UserGroup> {
        let mut tx = self.begin_transaction().await?;
        if request.is_default {
            Self::clear_default_flag(&mut tx, None).await?;
        }

        let group = sqlx::query_as::<_, UserGroup>(
            r#"
            INSERT INTO user_groups (id, name, description, max_tunnels, max_traffic,
                                     upload_limit, download_limit, is_default)
            VALUES ($1, $2, $3, COALESCE($4, 5), COALESCE($5, 10737418240), $6, $7, $8)
            RETURNING id, name, description, max_tunnels, max_traffic, upload_limit, download_limit,
                      is_default, package_id, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.max_tunnels)
        .bind(request.max_traffic)
        .bind(request.upload_limit)
        .bind(request.download_limit)
        .bind(request.is_default)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to create user group")?;

        tx.commit().await.context("Failed to commit group creation")?;
        info!(group_id = %group.id, name = %group.name, is_default = group.is_default, "user group created");
        Ok(group)
    }

    pub async fn update_group(&self, group_id: Uuid, request: &UpdateGroupRequest) -> Result<Option<UserGroup>> {
        let mut tx = self.begin_transaction().await?;
        if request.is_default == Some(true) {
            Self::clear_default_flag(&mut tx, Some(group_id)).await?;
        }

        let group = sqlx::query_as::<_, UserGroup>(
            r#"
            UPDATE user_groups SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                max_tunnels = COALESCE($4, max_tunnels),
                max_traffic = COALESCE($5, max_traffic),
                upload_limit = COALESCE($6, upload_limit),
                download_limit = COALESCE($7, download_limit),
                is_default = COALESCE($8, is_default),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, description, max_tunnels, max_traffic, upload_limit, download_limit,
                      is_default, package_id, created_at, updated_at
            "#,
        )
        .bind(group_id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.max_tunnels)
        .bind(request.max_traffic)
        .bind(request.upload_limit)
        .bind(request.download_limit)
        .bind(request.is_default)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to update user group")?;

        tx.commit().await.context("Failed to commit group update")?;
        Ok(group)
    }

    /// Refuses to delete the default group or a group that still has members
    pub async fn delete_group(&self, group_id: Uuid) -> Result<DeleteOutcome> {
        let mut tx = self.begin_transaction().await?;

        let group = sqlx::query_as::<_, UserGroup>(
            r#"
            SELECT id, name, description, max_tunnels, max_traffic, upload_limit, download_limit,
                   is_default, package_id, created_at, updated_at
            FROM user_groups WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock user group")?;

        let Some(group) = group else {
            return Ok(DeleteOutcome::NotFound);
        };
        if group.is_default {
            return Ok(DeleteOutcome::InUse("The default group cannot be deleted".to_string()));
        }

        let members: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE user_group_id = $1")
            .bind(group_id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to count group members")?;
        if members > 0 {
            return Ok(DeleteOutcome::InUse(format!("Group still has {} member(s)", members)));
        }

        sqlx::query("DELETE FROM user_groups WHERE id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete user group")?;
        tx.commit().await.context("Failed to commit group deletion")?;

        info!(group_id = %group_id, name = %group.name, "user group deleted");
        Ok(DeleteOutcome::Deleted)
    }

    pub async fn list_group_users(&self, group_id: Uuid) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, real_name, phone, is_admin, is_active,
                   user_group_id, total_traffic, created_at, updated_at, last_login
            FROM users WHERE user_group_id = $1
            ORDER BY username
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list group users")?;

        Ok(users)
    }

    // === Packages ===

    pub async fn list_packages(&self, include_inactive: bool) -> Result<Vec<Package>> {
        let packages = sqlx::query_as::<_, Package>(
            r#"
            SELECT id, name, description, price, duration_days, max_tunnels, max_traffic,
                   upload_limit, download_limit, is_active, created_at, updated_at
            FROM packages
            WHERE $1 OR is_active
            ORDER BY price, name
            "#,
        )
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list packages")?;

        Ok(packages)
    }

    pub async fn get_package_by_id(&self, package_id: Uuid) -> Result<Option<Package>> {
        let package = sqlx::query_as::<_, Package>(
            r#"
            SELECT id, name, description, price, duration_days, max_tunnels, max_traffic,
                   upload_limit, download_limit, is_active, created_at, updated_at
            FROM packages WHERE id = $1
            "#,
        )
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get package")?;

        Ok(package)
    }

    pub async fn package_name_taken(&self, name: &str, excluding: Option<Uuid>) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM packages WHERE name = $1 AND ($2::uuid IS NULL OR id <> $2))",
        )
        .bind(name)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check package name")?;
        Ok(taken)
    }

    pub async fn create_package(&self, request: &CreatePackageRequest) -> Result<Package> {
        let package = sqlx::query_as::<_, Package>(
            r#"
            INSERT INTO packages (id, name, description, price, duration_days, max_tunnels,
                                  max_traffic, upload_limit, download_limit, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, TRUE))
            RETURNING id, name, description, price, duration_days, max_tunnels, max_traffic,
                      upload_limit, download_limit, is_active, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.price)
        .bind(request.duration_days)
        .bind(request.max_tunnels)
        .bind(request.max_traffic)
        .bind(request.upload_limit)
        .bind(request.download_limit)
        .bind(request.is_active)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create package")?;

        info!(package_id = %package.id, name = %package.name, "package created");
        Ok(package)
    }

    pub async fn update_package(&self, package_id: Uuid, request: &UpdatePackageRequest) -> Result<Option<Package>> {
        let package = sqlx::query_as::<_, Package>(
            r#"
            UPDATE packages SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                price = COALESCE($4, price),
                duration_days = COALESCE($5, duration_days),
                max_tunnels = COALESCE($6, max_tunnels),
                max_traffic = COALESCE($7, max_traffic),
                upload_limit = COALESCE($8, upload_limit),
                download_limit = COALESCE($9, download_limit),
                is_active = COALESCE($10, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, description, price, duration_days, max_tunnels, max_traffic,
                      upload_limit, download_limit, is_active, created_at, updated_at
            "#,
        )
        .bind(package_id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.price)
        .bind(request.duration_days)
        .bind(request.max_tunnels)
        .bind(request.max_traffic)
        .bind(request.upload_limit)
        .bind(request.download_limit)
        .bind(request.is_active)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update package")?;

        Ok(package)
    }

    /// Refuses while any purchase of the package is still active
    pub async fn delete_package(&self, package_id: Uuid) -> Result<DeleteOutcome> {
        let mut tx = self.begin_transaction().await?;

        let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM packages WHERE id = $1 FOR UPDATE")
            .bind(package_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to lock package")?;
        if locked.is_none() {
            return Ok(DeleteOutcome::NotFound);
        }

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_packages WHERE package_id = $1 AND is_active",
        )
        .bind(package_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to count active purchases")?;
        if active > 0 {
            return Ok(DeleteOutcome::InUse(format!("Package has {} active purchase(s)", active)));
        }

        sqlx::query("DELETE FROM user_packages WHERE package_id = $1")
            .bind(package_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete expired purchases")?;
        sqlx::query("DELETE FROM packages WHERE id = $1")
            .bind(package_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete package")?;
        tx.commit().await.context("Failed to commit package deletion")?;

        info!(package_id = %package_id, "package deleted");
        Ok(DeleteOutcome::Deleted)
    }

    pub async fn list_user_packages(&self, user_id: Uuid) -> Result<Vec<UserPackageView>> {
        let purchases = sqlx::query_as::<_, UserPackageView>(
            r#"
            SELECT up.id, up.user_id, up.package_id, up.start_date, up.end_date, up.is_active,
                   up.used_traffic, up.payment_amount, up.payment_status, up.created_at,
                   p.name AS package_name
            FROM user_packages up
            JOIN packages p ON p.id = up.package_id
            WHERE up.user_id = $1
            ORDER BY up.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list user packages")?;

        Ok(purchases)
    }

    /// Records the purchase and moves the user into the package's group in
    /// one transaction, creating the group on first purchase.
    pub async fn purchase_package(&self, user_id: Uuid, package: &Package) -> Result<(UserPackage, UserGroup)> {
        let mut tx = self.begin_transaction().await?;
        let now = Utc::now();

        let user_package = sqlx::query_as::<_, UserPackage>(
            r#"
            INSERT INTO user_packages (id, user_id, package_id, start_date, end_date, is_active,
                                       used_traffic, payment_amount, payment_status)
            VALUES ($1, $2, $3, $4, $5, TRUE, 0, $6, 'completed')
            RETURNING id, user_id, package_id, start_date, end_date, is_active, used_traffic,
                      payment_amount, payment_status, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(package.id)
        .bind(now)
        .bind(now + Duration::days(package.duration_days as i64))
        .bind(package.price)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to record package purchase")?;

        let existing = sqlx::query_as::<_, UserGroup>(
            r#"
            UPDATE user_groups SET
                max_tunnels = $2, max_traffic = $3, upload_limit = $4, download_limit = $5,
                updated_at = NOW()
            WHERE id = (SELECT id FROM user_groups WHERE package_id = $1 ORDER BY created_at LIMIT 1)
            RETURNING id, name, description, max_tunnels, max_traffic, upload_limit, download_limit,
                      is_default, package_id, created_at, updated_at
            "#,
        )
        .bind(package.id)
        .bind(package.max_tunnels)
        .bind(package.max_traffic)
        .bind(package.upload_limit)
        .bind(package.download_limit)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to refresh package group")?;

        let group = match existing {
            Some(group) => group,
            None => {
                let name_taken: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM user_groups WHERE name = $1)")
                        .bind(&package.name)
                        .fetch_one(&mut *tx)
                        .await
                        .context("Failed to check package group name")?;
                let name = if name_taken {
                    format!("{} ({})", package.name, &package.id.simple().to_string()[..8])
                } else {
                    package.name.clone()
                };

                sqlx::query_as::<_, UserGroup>(
                    r#"
                    INSERT INTO user_groups (id, name, description, max_tunnels, max_traffic,
                                             upload_limit, download_limit, is_default, package_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8)
                    RETURNING id, name, description, max_tunnels, max_traffic, upload_limit,
                              download_limit, is_default, package_id, created_at, updated_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&name)
                .bind(format!("Created from package {}", package.name))
                .bind(package.max_tunnels)
                .bind(package.max_traffic)
                .bind(package.upload_limit)
                .bind(package.download_limit)
                .bind(package.id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to create package group")?
            }
        };

        sqlx::query("UPDATE users SET user_group_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(group.id)
            .execute(&mut *tx)
            .await
            .context("Failed to move user into package group")?;

        tx.commit().await.context("Failed to commit package purchase")?;
        info!(
            user_id = %user_id,
            package_id = %package.id,
            group_id = %group.id,
            "package purchased"
        );
        Ok((user_package, group))
    }

    // === Nodes ===

    pub async fn node_name_taken(&self, name: &str, excluding: Option<Uuid>) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM nodes WHERE name = $1 AND ($2::uuid IS NULL OR id <> $2))",
        )
        .bind(name)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check node name")?;
        Ok(taken)
    }

    pub async fn create_node(&self, owner_id: Uuid, request: &CreateNodeRequest) -> Result<Node> {
        let node = sqlx::query_as::<_, Node>(
            r#"
            INSERT INTO nodes (id, name, host, port, dashboard_port, dashboard_user,
                               dashboard_password, token, status, region, description, owner_id)
            VALUES ($1, $2, $3, COALESCE($4, 7000), $5, $6, $7, $8, 'unknown', $9, $10, $11)
            RETURNING id, name, host, port, dashboard_port, dashboard_user, dashboard_password,
                      token, status, region, description, owner_id, last_checked_at,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(&request.host)
        .bind(request.port)
        .bind(request.dashboard_port)
        .bind(&request.dashboard_user)
        .bind(&request.dashboard_password)
        .bind(&request.token)
        .bind(&request.region)
        .bind(&request.description)
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create node")?;

        info!(node_id = %node.id, name = %node.name, host = %node.host, "node created");
        Ok(node)
    }

    pub async fn update_node(&self, node_id: Uuid, request: &UpdateNodeRequest) -> Result<Option<Node>> {
        let node = sqlx::query_as::<_, Node>(
            r#"
            UPDATE nodes SET
                name = COALESCE($2, name),
                host = COALESCE($3, host),
                port = COALESCE($4, port),
                dashboard_port = COALESCE($5, dashboard_port),
                dashboard_user = COALESCE($6, dashboard_user),
                dashboard_password = COALESCE($7, dashboard_password),
                token = COALESCE($8, token),
                region = COALESCE($9, region),
                description = COALESCE($10, description),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, host, port, dashboard_port, dashboard_user, dashboard_password,
                      token, status, region, description, owner_id, last_checked_at,
                      created_at, updated_at
            "#,
        )
        .bind(node_id)
        .bind(&request.name)
        .bind(&request.host)
        .bind(request.port)
        .bind(request.dashboard_port)
        .bind(&request.dashboard_user)
        .bind(&request.dashboard_password)
        .bind(&request.token)
        .bind(&request.region)
        .bind(&request.description)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update node")?;

        Ok(node)
    }

    /// Refuses while any tunnel still references the node
    pub async fn delete_node(&self, node_id: Uuid) -> Result<DeleteOutcome> {
        let mut tx = self.begin_transaction().await?;

        let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM nodes WHERE id = $1 FOR UPDATE")
            .bind(node_id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to lock node")?;
        if locked.is_none() {
            return Ok(DeleteOutcome::NotFound);
        }

        let tunnels: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tunnels WHERE node_id = $1")
            .bind(node_id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to count node tunnels")?;
        if tunnels > 0 {
            return Ok(DeleteOutcome::InUse(format!(
                "Node still has {} tunnel(s); delete them first (force=true if the node is gone)",
                tunnels
            )));
        }

        sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete node")?;
        tx.commit().await.context("Failed to commit node deletion")?;

        info!(node_id = %node_id, "node deleted");
        Ok(DeleteOutcome::Deleted)
    }

    // === Tunnels ===

    pub async fn tunnel_name_taken(&self, user_id: Uuid, name: &str, excluding: Option<Uuid>) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM tunnels
                WHERE user_id = $1 AND name = $2 AND ($3::uuid IS NULL OR id <> $3)
            )
            "#,
        )
        .bind(user_id)
        .bind(name)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check tunnel name")?;
        Ok(taken)
    }

    /// Whether a port-based tunnel on `node_id` already uses `remote_port`
    pub async fn remote_port_taken(&self, node_id: Uuid, remote_port: i32, excluding: Option<Uuid>) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM tunnels
                WHERE node_id = $1 AND remote_port = $2
                  AND tunnel_type IN ('tcp', 'udp')
                  AND ($3::uuid IS NULL OR id <> $3)
            )
            "#,
        )
        .bind(node_id)
        .bind(remote_port)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check remote port")?;
        Ok(taken)
    }

    pub async fn create_tunnel(&self, new_tunnel: &NewTunnel) -> Result<Tunnel> {
        let tunnel = sqlx::query_as::<_, Tunnel>(
            r#"
            INSERT INTO tunnels (id, name, tunnel_type, local_ip, local_port, remote_port,
                                 custom_domains, subdomain, description, status, desired_status,
                                 node_id, user_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'stopped', 'stopped', $10, $11)
            RETURNING id, name, tunnel_type, local_ip, local_port, remote_port, custom_domains,
                      subdomain, description, status, desired_status, last_error, bytes_in,
                      bytes_out, node_id, user_id, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_tunnel.name)
        .bind(new_tunnel.tunnel_type)
        .bind(&new_tunnel.local_ip)
        .bind(new_tunnel.local_port)
        .bind(new_tunnel.remote_port)
        .bind(&new_tunnel.custom_domains)
        .bind(&new_tunnel.subdomain)
        .bind(&new_tunnel.description)
        .bind(new_tunnel.node_id)
        .bind(new_tunnel.user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create tunnel")?;

        info!(tunnel_id = %tunnel.id, user_id = %tunnel.user_id, node_id = %tunnel.node_id, "tunnel created");
        Ok(tunnel)
    }

    /// Lists tunnels, restricted to `owner` when given
    pub async fn list_tunnels(&self, owner: Option<Uuid>, filter: &TunnelFilter) -> Result<Vec<Tunnel>> {
        let tunnels = sqlx::query_as::<_, Tunnel>(
            r#"
            SELECT id, name, tunnel_type, local_ip, local_port, remote_port, custom_domains,
                   subdomain, description, status, desired_status, last_error, bytes_in,
                   bytes_out, node_id, user_id, created_at, updated_at
            FROM tunnels
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::uuid IS NULL OR node_id = $2)
              AND ($3::tunnel_type IS NULL OR tunnel_type = $3)
              AND ($4::tunnel_status IS NULL OR status = $4)
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner)
        .bind(filter.node_id)
        .bind(filter.tunnel_type)
        .bind(filter.status)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list tunnels")?;

        Ok(tunnels)
    }

    /// Applies a configuration change; the caller makes sure the tunnel is not live
    /// Overwrites the tunnel's configuration with an already merged edit
    pub async fn update_tunnel(&self, tunnel_id: Uuid, edit: &TunnelEdit) -> Result<Option<Tunnel>> {
        let tunnel = sqlx::query_as::<_, Tunnel>(
            r#"
            UPDATE tunnels SET
                name = $2,
                tunnel_type = $3,
                local_ip = $4,
                local_port = $5,
                remote_port = $6,
                custom_domains = $7,
                subdomain = $8,
                description = $9,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, tunnel_type, local_ip, local_port, remote_port, custom_domains,
                      subdomain, description, status, desired_status, last_error, bytes_in,
                      bytes_out, node_id, user_id, created_at, updated_at
            "#,
        )
        .bind(tunnel_id)
        .bind(&edit.name)
        .bind(edit.tunnel_type)
        .bind(&edit.local_ip)
        .bind(edit.local_port)
        .bind(edit.remote_port)
        .bind(&edit.custom_domains)
        .bind(&edit.subdomain)
        .bind(&edit.description)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update tunnel")?;

        Ok(tunnel)
    }

    // === Traffic ===

    /// Samples recorded in the last `minutes` minutes, newest first
    pub async fn get_recent_traffic(&self, user_id: Uuid, minutes: i64) -> Result<Vec<TrafficLog>> {
        let since = Utc::now() - Duration::minutes(minutes);
        let logs = sqlx::query_as::<_, TrafficLog>(
            r#"
            SELECT id, user_id, tunnel_id, upload, download, timestamp
            FROM traffic_logs
            WHERE user_id = $1 AND timestamp >= $2
            ORDER BY timestamp DESC
            LIMIT 1000
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get recent traffic")?;

        Ok(logs)
    }

    /// Per-day totals for the last `days` days including today
    pub async fn get_daily_traffic(&self, user_id: Uuid, days: i64) -> Result<Vec<DailyTraffic>> {
        let since = (Utc::now() - Duration::days(days.saturating_sub(1))).date_naive();
        let rows = sqlx::query_as::<_, DailyTraffic>(
            r#"
            SELECT date,
                   COALESCE(SUM(upload), 0)::BIGINT AS upload,
                   COALESCE(SUM(download), 0)::BIGINT AS download
            FROM traffic_summaries
            WHERE user_id = $1 AND date >= $2
            GROUP BY date
            ORDER BY date
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get daily traffic")?;

        Ok(rows)
    }

    /// Per-tunnel totals, largest first
    pub async fn get_traffic_overview(&self, user_id: Uuid) -> Result<TrafficOverview> {
        let tunnels = sqlx::query_as::<_, TunnelTrafficTotal>(
            r#"
            SELECT t.id AS tunnel_id, t.name AS tunnel_name,
                   COALESCE(SUM(s.upload), 0)::BIGINT AS upload,
                   COALESCE(SUM(s.download), 0)::BIGINT AS download,
                   COALESCE(SUM(s.upload + s.download), 0)::BIGINT AS total
            FROM tunnels t
            LEFT JOIN traffic_summaries s ON s.tunnel_id = t.id
            WHERE t.user_id = $1
            GROUP BY t.id, t.name
            ORDER BY total DESC, t.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get traffic overview")?;

        let total_upload = tunnels.iter().map(|t| t.upload).sum();
        let total_download = tunnels.iter().map(|t| t.download).sum();
        Ok(TrafficOverview {
            total_upload,
            total_download,
            total_traffic: total_upload + total_download,
            tunnels,
        })
    }

    // === Operation logs ===

    pub async fn insert_operation_log(&self, entry: &NewOperationLog) -> Result<OperationLog> {
        let log = sqlx::query_as::<_, OperationLog>(
            r#"
            INSERT INTO operation_logs (id, user_id, action, resource_type, resource_id,
                                        resource_name, details, ip_address, user_agent,
                                        status, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, user_id, action, resource_type, resource_id, resource_name, details,
                      ip_address, user_agent, status, error_message, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(entry.resource_id)
        .bind(&entry.resource_name)
        .bind(&entry.details)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.status)
        .bind(&entry.error_message)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert operation log")?;

        Ok(log)
    }

    /// Lists audit rows, restricted to `user_id` when given
    pub async fn list_operation_logs(&self, user_id: Option<Uuid>, query: &OperationLogQuery) -> Result<Vec<OperationLog>> {
        let pagination = Pagination { limit: query.limit, offset: query.offset };
        let logs = sqlx::query_as::<_, OperationLog>(
            r#"
            SELECT id, user_id, action, resource_type, resource_id, resource_name, details,
                   ip_address, user_agent, status, error_message, created_at
            FROM operation_logs
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR action = $2)
              AND ($3::text IS NULL OR resource_type = $3)
              AND ($4::operation_status IS NULL OR status = $4)
            ORDER BY created_at DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(user_id)
        .bind(&query.action)
        .bind(&query.resource_type)
        .bind(query.status)
        .bind(pagination.limit_or(50, 200))
        .bind(pagination.offset())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list operation logs")?;

        Ok(logs)
    }

    // === Seeding and maintenance ===

    /// Creates the admin account, default group and default packages when missing
    pub async fn seed_defaults(&self, admin: &NewUser) -> Result<SeedReport> {
        let mut tx = self.begin_transaction().await?;
        let mut report = SeedReport::default();

        let has_default: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM user_groups WHERE is_default)")
            .fetch_one(&mut *tx)
            .await
            .context("Failed to check default group")?;
        if !has_default {
            let inserted = sqlx::query(
                r#"
                INSERT INTO user_groups (id, name, description, max_tunnels, max_traffic, is_default)
                VALUES ($1, 'default', 'Default group for new users', 3, $2, TRUE)
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(GIB)
            .execute(&mut *tx)
            .await
            .context("Failed to seed default group")?;
            report.default_group_created = inserted.rows_affected() > 0;
        }

        for (name, description, max_tunnels, traffic_gib) in DEFAULT_PACKAGES {
            let inserted = sqlx::query(
                r#"
                INSERT INTO packages (id, name, description, price, duration_days, max_tunnels, max_traffic)
                VALUES ($1, $2, $3, 0, $4, $5, $6)
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(description)
            .bind(DEFAULT_PACKAGE_DAYS)
            .bind(max_tunnels)
            .bind(traffic_gib * GIB)
            .execute(&mut *tx)
            .await
            .context("Failed to seed package")?;
            report.packages_created += inserted.rows_affected();
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, username, email, password_hash, is_admin, is_active)
            VALUES ($1, $2, $3, $4, TRUE, TRUE)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&admin.username)
        .bind(&admin.email)
        .bind(&admin.password_hash)
        .execute(&mut *tx)
        .await
        .context("Failed to seed admin account")?;
        report.admin_created = inserted.rows_affected() > 0;

        tx.commit().await.context("Failed to commit seed data")?;
        info!(
            admin_created = report.admin_created,
            default_group_created = report.default_group_created,
            packages_created = report.packages_created,
            "default data seeded"
        );
        Ok(report)
    }

    /// Deactivates purchases past their end date. Users left without an
    /// active purchase whose group came from a package go back to the default group.
    pub async fn expire_packages(&self, now: DateTime<Utc>) -> Result<ExpiryReport> {
        let mut tx = self.begin_transaction().await?;

        let expired_users: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE user_packages SET is_active = FALSE
            WHERE is_active AND end_date < $1
            RETURNING user_id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to expire packages")?;

        let mut report = ExpiryReport {
            expired: expired_users.len() as u64,
            reverted_users: Vec::new(),
        };
        if expired_users.is_empty() {
            tx.commit().await.context("Failed to commit package expiry")?;
            return Ok(report);
        }

        report.reverted_users = sqlx::query_scalar(
            r#"
            UPDATE users u SET
                user_group_id = (SELECT id FROM user_groups WHERE is_default LIMIT 1),
                updated_at = NOW()
            FROM user_groups g
            WHERE u.id = ANY($1)
              AND g.id = u.user_group_id
              AND g.package_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM user_packages up WHERE up.user_id = u.id AND up.is_active
              )
            RETURNING u.id
            "#,
        )
        .bind(&expired_users)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to revert users to the default group")?;

        tx.commit().await.context("Failed to commit package expiry")?;
        for user_id in &report.reverted_users {
            warn!(user_id = %user_id, "package expired, user moved back to the default group");
        }
        info!(expired = report.expired, reverted = report.reverted_users.len(), "package expiry completed");
        Ok(report)
    }

    /// Removes raw traffic samples older than `days`; daily summaries are kept
    pub async fn prune_traffic_logs(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days);

        let result = sqlx::query("DELETE FROM traffic_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to prune traffic logs")?;

        info!("Pruned {} old traffic logs", result.rows_affected());
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Registry for Database {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        self.get_user_by_id(user_id).await
    }

    async fn get_group(&self, group_id: Uuid) -> Result<Option<UserGroup>> {
        self.get_group_by_id(group_id).await
    }

    async fn get_default_group(&self) -> Result<Option<UserGroup>> {
        let group = sqlx::query_as::<_, UserGroup>(
            r#"
            SELECT id, name, description, max_tunnels, max_traffic, upload_limit, download_limit,
                   is_default, package_id, created_at, updated_at
            FROM user_groups WHERE is_default
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get default group")?;

        Ok(group)
    }

    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>> {
        let node = sqlx::query_as::<_, Node>(
            r#"
            SELECT id, name, host, port, dashboard_port, dashboard_user, dashboard_password,
                   token, status, region, description, owner_id, last_checked_at,
                   created_at, updated_at
            FROM nodes WHERE id = $1
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get node")?;

        Ok(node)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = sqlx::query_as::<_, Node>(
            r#"
            SELECT id, name, host, port, dashboard_port, dashboard_user, dashboard_password,
                   token, status, region, description, owner_id, last_checked_at,
                   created_at, updated_at
            FROM nodes
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list nodes")?;

        Ok(nodes)
    }

    async fn record_node_status(
        &self,
        node_id: Uuid,
        status: NodeStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE nodes SET status = $2, last_checked_at = $3 WHERE id = $1")
            .bind(node_id)
            .bind(status)
            .bind(checked_at)
            .execute(&self.pool)
            .await
            .context("Failed to record node status")?;
        Ok(())
    }

    async fn get_tunnel(&self, tunnel_id: Uuid) -> Result<Option<Tunnel>> {
        let tunnel = sqlx::query_as::<_, Tunnel>(
            r#"
            SELECT id, name, tunnel_type, local_ip, local_port, remote_port, custom_domains,
                   subdomain, description, status, desired_status, last_error, bytes_in,
                   bytes_out, node_id, user_id, created_at, updated_at
            FROM tunnels WHERE id = $1
            "#,
        )
        .bind(tunnel_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get tunnel")?;

        Ok(tunnel)
    }

    async fn list_all_tunnels(&self) -> Result<Vec<Tunnel>> {
        self.list_tunnels(None, &TunnelFilter::default()).await
    }

    async fn list_user_tunnels(&self, user_id: Uuid) -> Result<Vec<Tunnel>> {
        self.list_tunnels(Some(user_id), &TunnelFilter::default()).await
    }

    async fn count_running_tunnels(&self, user_id: Uuid, excluding: Option<Uuid>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tunnels
            WHERE user_id = $1 AND status = 'running' AND ($2::uuid IS NULL OR id <> $2)
            "#,
        )
        .bind(user_id)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count running tunnels")?;
        Ok(count)
    }

    async fn set_desired_status(&self, tunnel_id: Uuid, desired: DesiredState) -> Result<()> {
        sqlx::query("UPDATE tunnels SET desired_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(tunnel_id)
            .bind(desired)
            .execute(&self.pool)
            .await
            .context("Failed to set desired tunnel status")?;
        Ok(())
    }

    async fn record_tunnel_status(
        &self,
        tunnel_id: Uuid,
        status: TunnelStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE tunnels SET status = $2, last_error = $3, updated_at = NOW() WHERE id = $1")
            .bind(tunnel_id)
            .bind(status)
            .bind(last_error)
            .execute(&self.pool)
            .await
            .context("Failed to record tunnel status")?;
        Ok(())
    }

    async fn delete_tunnel(&self, tunnel_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tunnels WHERE id = $1")
            .bind(tunnel_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete tunnel")?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_traffic(&self, entry: &TrafficEntry) -> Result<TrafficTotals> {
        let mut tx = self.begin_transaction().await?;

        sqlx::query(
            r#"
            INSERT INTO traffic_logs (id, user_id, tunnel_id, upload, download, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(entry.tunnel_id)
        .bind(entry.upload)
        .bind(entry.download)
        .bind(entry.recorded_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert traffic log")?;

        // BIGINT overflow raises 22003 and rolls the whole sample back
        let user_total: i64 = sqlx::query_scalar(
            r#"
            UPDATE users SET total_traffic = total_traffic + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING total_traffic
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.upload.checked_add(entry.download).ok_or(CounterOverflow)?)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| counter_error(e, "Failed to update user traffic total"))?;

        let counters = sqlx::query(
            r#"
            UPDATE tunnels SET bytes_in = bytes_in + $3, bytes_out = bytes_out + $4
            WHERE id = $1 AND user_id = $2
            RETURNING bytes_in, bytes_out
            "#,
        )
        .bind(entry.tunnel_id)
        .bind(entry.user_id)
        .bind(entry.download)
        .bind(entry.upload)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| counter_error(e, "Failed to update tunnel traffic counters"))?;

        let summary = sqlx::query_as::<_, TrafficSummary>(
            r#"
            INSERT INTO traffic_summaries (id, user_id, tunnel_id, date, upload, download)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, tunnel_id, date) DO UPDATE SET
                upload = traffic_summaries.upload + EXCLUDED.upload,
                download = traffic_summaries.download + EXCLUDED.download,
                updated_at = NOW()
            RETURNING id, user_id, tunnel_id, date, upload, download, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(entry.tunnel_id)
        .bind(entry.day())
        .bind(entry.upload)
        .bind(entry.download)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| counter_error(e, "Failed to upsert traffic summary"))?;

        tx.commit().await.context("Failed to commit traffic sample")?;

        Ok(TrafficTotals {
            user_total,
            tunnel_bytes_in: counters.get("bytes_in"),
            tunnel_bytes_out: counters.get("bytes_out"),
            summary,
        })
    }
}
