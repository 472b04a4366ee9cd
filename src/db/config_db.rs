use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::models::alert::{Alert, AlertGroup, AlertSla, AlertStateRow};
use crate::models::device::Device;
use crate::models::escalation::EscalationPolicyRow;
use crate::models::oncall::OnCallScheduleRow;
use crate::models::rule::RuleRow;
use crate::models::tenant::Tenant;
use crate::models::user::{TenantUser, TenantUserView, User};

/// Tenant-scoped control-plane store: tenants, users, devices, rules,
/// alerts and their history, escalation/on-call config, and notification
/// channels. A single `Mutex<Connection>` serializes every statement,
/// which keeps every critical section short without extra locking.
pub struct ConfigDb {
    conn: Mutex<Connection>,
}

impl ConfigDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenants (
                id          TEXT PRIMARY KEY,
                slug        TEXT NOT NULL UNIQUE,
                name        TEXT NOT NULL,
                tier        TEXT NOT NULL DEFAULT 'free',
                max_devices INTEGER,
                max_users   INTEGER,
                max_telemetry_points_per_day INTEGER,
                max_retention_days INTEGER,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS users (
                id               TEXT PRIMARY KEY,
                email            TEXT NOT NULL UNIQUE,
                password_verifier TEXT NOT NULL,
                is_system_admin  INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS tenant_users (
                tenant_id      TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                user_id        TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role           TEXT NOT NULL DEFAULT 'member',
                is_tenant_admin INTEGER NOT NULL DEFAULT 0,
                joined_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                PRIMARY KEY (tenant_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_tenant_users_user ON tenant_users(user_id);

            CREATE TABLE IF NOT EXISTS devices (
                id          TEXT PRIMARY KEY,
                tenant_id   TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name        TEXT NOT NULL,
                device_type TEXT NOT NULL DEFAULT '',
                protocol    TEXT NOT NULL CHECK(protocol IN ('mqtt','coap','amqp','opcua')),
                status      TEXT NOT NULL DEFAULT 'offline' CHECK(status IN ('active','offline','error','maintenance')),
                metadata    TEXT NOT NULL DEFAULT '{}',
                last_seen_at TEXT,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_devices_tenant ON devices(tenant_id);

            CREATE TABLE IF NOT EXISTS rules (
                id               TEXT PRIMARY KEY,
                tenant_id        TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name             TEXT NOT NULL,
                condition_spec   TEXT NOT NULL,
                action_spec      TEXT NOT NULL DEFAULT '[]',
                priority         INTEGER NOT NULL DEFAULT 30,
                enabled          INTEGER NOT NULL DEFAULT 1,
                cooldown_seconds INTEGER NOT NULL DEFAULT 300,
                eval_interval_secs INTEGER NOT NULL DEFAULT 30,
                scope_spec       TEXT NOT NULL,
                last_evaluated_at TEXT,
                created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_rules_tenant ON rules(tenant_id);

            CREATE TABLE IF NOT EXISTS alerts (
                id                     TEXT PRIMARY KEY,
                tenant_id              TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                device_id              TEXT NOT NULL,
                rule_id                TEXT,
                severity               TEXT NOT NULL CHECK(severity IN ('critical','high','medium','low','info')),
                message                TEXT NOT NULL,
                created_at             TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                metadata               TEXT NOT NULL DEFAULT '{}',
                escalation_policy_id   TEXT,
                current_escalation_tier INTEGER NOT NULL DEFAULT 0,
                last_escalation_at     TEXT,
                grouped_alert_id       TEXT,
                duplicate_count        INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_tenant ON alerts(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_rule_device ON alerts(tenant_id, rule_id, device_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS alert_states (
                id         TEXT PRIMARY KEY,
                alert_id   TEXT NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
                state      TEXT NOT NULL CHECK(state IN ('new','acknowledged','investigating','resolved')),
                changed_by TEXT NOT NULL,
                changed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                note       TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alert_states_alert ON alert_states(alert_id, changed_at DESC);

            CREATE TABLE IF NOT EXISTS alert_groups (
                id                      TEXT PRIMARY KEY,
                tenant_id               TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                device_id               TEXT NOT NULL,
                rule_id                 TEXT,
                severity                TEXT NOT NULL,
                group_key               TEXT NOT NULL,
                first_occurrence_at     TEXT NOT NULL,
                last_occurrence_at      TEXT NOT NULL,
                occurrence_count        INTEGER NOT NULL DEFAULT 1,
                status                  TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','closed')),
                representative_alert_id TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_alert_groups_active_key
                ON alert_groups(tenant_id, group_key) WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS alert_slas (
                alert_id              TEXT PRIMARY KEY REFERENCES alerts(id) ON DELETE CASCADE,
                severity              TEXT NOT NULL,
                tta_target_minutes    INTEGER NOT NULL,
                ttr_target_minutes    INTEGER NOT NULL,
                tta_actual            REAL,
                ttr_actual            REAL,
                tta_breached          INTEGER NOT NULL DEFAULT 0,
                ttr_breached          INTEGER NOT NULL DEFAULT 0,
                tta_breach_notified   INTEGER NOT NULL DEFAULT 0,
                ttr_breach_notified   INTEGER NOT NULL DEFAULT 0,
                created_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS escalation_policies (
                id              TEXT PRIMARY KEY,
                tenant_id       TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name            TEXT NOT NULL,
                tiers_spec      TEXT NOT NULL,
                severity_filter TEXT NOT NULL DEFAULT '[]',
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_escalation_policies_tenant ON escalation_policies(tenant_id);

            CREATE TABLE IF NOT EXISTS on_call_schedules (
                id             TEXT PRIMARY KEY,
                tenant_id      TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name           TEXT NOT NULL,
                rotation_spec  TEXT NOT NULL,
                overrides_spec TEXT NOT NULL DEFAULT '{}',
                timezone       TEXT NOT NULL DEFAULT 'UTC',
                created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_on_call_schedules_tenant ON on_call_schedules(tenant_id);

            CREATE TABLE IF NOT EXISTS notification_channels (
                id           TEXT PRIMARY KEY,
                tenant_id    TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name         TEXT NOT NULL,
                channel_type TEXT NOT NULL CHECK(channel_type IN ('email','sms','webhook')),
                config       TEXT NOT NULL,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_notification_channels_tenant ON notification_channels(tenant_id);

            CREATE TABLE IF NOT EXISTS refresh_tokens (
                token      TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                tenant_id  TEXT,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS telemetry_quota_counters (
                tenant_id TEXT NOT NULL,
                day       TEXT NOT NULL,
                count     INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, day)
            );
            ",
        )?;
        Ok(())
    }

    // ── Tenants ──

    pub fn create_tenant(&self, t: &Tenant) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tenants (id, slug, name, tier, max_devices, max_users, max_telemetry_points_per_day, max_retention_days)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                t.id, t.slug, t.name, t.tier, t.max_devices, t.max_users,
                t.max_telemetry_points_per_day, t.max_retention_days
            ],
        )?;
        Ok(())
    }

    pub fn get_tenant(&self, id: &str) -> anyhow::Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, slug, name, tier, max_devices, max_users, max_telemetry_points_per_day, max_retention_days, created_at, updated_at
             FROM tenants WHERE id = ?1",
            params![id],
            row_to_tenant,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_tenant_by_slug(&self, slug: &str) -> anyhow::Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, slug, name, tier, max_devices, max_users, max_telemetry_points_per_day, max_retention_days, created_at, updated_at
             FROM tenants WHERE slug = ?1",
            params![slug],
            row_to_tenant,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_tenants(&self) -> anyhow::Result<Vec<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, slug, name, tier, max_devices, max_users, max_telemetry_points_per_day, max_retention_days, created_at, updated_at
             FROM tenants ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_tenant)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn update_tenant(
        &self,
        id: &str,
        name: Option<&str>,
        tier: Option<&str>,
        max_devices: Option<i64>,
        max_users: Option<i64>,
        max_telemetry_points_per_day: Option<i64>,
        max_retention_days: Option<i64>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut tenant = conn
            .query_row(
                "SELECT id, slug, name, tier, max_devices, max_users, max_telemetry_points_per_day, max_retention_days, created_at, updated_at
                 FROM tenants WHERE id = ?1",
                params![id],
                row_to_tenant,
            )
            .optional()?;
        let Some(t) = tenant.take() else {
            return Ok(false);
        };
        conn.execute(
            "UPDATE tenants SET name=?2, tier=?3, max_devices=?4, max_users=?5,
             max_telemetry_points_per_day=?6, max_retention_days=?7,
             updated_at=strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id=?1",
            params![
                id,
                name.unwrap_or(&t.name),
                tier.unwrap_or(&t.tier),
                max_devices.or(t.max_devices),
                max_users.or(t.max_users),
                max_telemetry_points_per_day.or(t.max_telemetry_points_per_day),
                max_retention_days.or(t.max_retention_days),
            ],
        )?;
        Ok(true)
    }

    pub fn delete_tenant(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM tenants WHERE id=?1", params![id])?;
        Ok(n > 0)
    }

    // ── Users & membership ──

    pub fn create_user(&self, user: &User) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, email, password_verifier, is_system_admin) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.email, user.password_verifier, user.is_system_admin],
        )?;
        Ok(())
    }

    pub fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, password_verifier, is_system_admin, created_at FROM users WHERE email=?1",
            params![email],
            row_to_user,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, password_verifier, is_system_admin, created_at FROM users WHERE id=?1",
            params![id],
            row_to_user,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Transparent legacy-hash migration : upgrades the
    /// stored verifier within the same call the authenticated login made.
    pub fn update_password_verifier(&self, user_id: &str, new_verifier: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET password_verifier=?2 WHERE id=?1",
            params![user_id, new_verifier],
        )?;
        Ok(())
    }

    pub fn create_tenant_user(&self, tu: &TenantUser) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tenant_users (tenant_id, user_id, role, is_tenant_admin) VALUES (?1, ?2, ?3, ?4)",
            params![tu.tenant_id, tu.user_id, tu.role, tu.is_tenant_admin],
        )?;
        Ok(())
    }

    /// Membership insert serialized with the user-cap check, same shape as
    /// `create_device_checked`. Returns `Err("quota")` at the cap and
    /// `Err("exists")` for a duplicate membership.
    pub fn create_tenant_user_checked(&self, tu: &TenantUser, cap: Option<i64>) -> anyhow::Result<Result<(), &'static str>> {
        let conn = self.conn.lock().unwrap();
        let already: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM tenant_users WHERE tenant_id=?1 AND user_id=?2",
                params![tu.tenant_id, tu.user_id],
                |r| r.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Ok(Err("exists"));
        }
        if let Some(cap) = cap {
            let current: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tenant_users WHERE tenant_id=?1",
                params![tu.tenant_id],
                |r| r.get(0),
            )?;
            if current >= cap {
                return Ok(Err("quota"));
            }
        }
        conn.execute(
            "INSERT INTO tenant_users (tenant_id, user_id, role, is_tenant_admin) VALUES (?1, ?2, ?3, ?4)",
            params![tu.tenant_id, tu.user_id, tu.role, tu.is_tenant_admin],
        )?;
        Ok(Ok(()))
    }

    pub fn get_tenant_user(&self, tenant_id: &str, user_id: &str) -> anyhow::Result<Option<TenantUser>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT tenant_id, user_id, role, is_tenant_admin, joined_at FROM tenant_users WHERE tenant_id=?1 AND user_id=?2",
            params![tenant_id, user_id],
            row_to_tenant_user,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_user_memberships(&self, user_id: &str) -> anyhow::Result<Vec<TenantUser>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tenant_id, user_id, role, is_tenant_admin, joined_at FROM tenant_users
             WHERE user_id=?1 ORDER BY joined_at",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_tenant_user)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_tenant_users(&self, tenant_id: &str) -> anyhow::Result<Vec<TenantUserView>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tu.user_id, u.email, tu.role, tu.is_tenant_admin, tu.joined_at
             FROM tenant_users tu JOIN users u ON u.id = tu.user_id
             WHERE tu.tenant_id = ?1 ORDER BY tu.joined_at",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| {
            Ok(TenantUserView {
                user_id: row.get(0)?,
                email: row.get(1)?,
                role: row.get(2)?,
                is_tenant_admin: row.get(3)?,
                joined_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_tenant_admins(&self, tenant_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM tenant_users WHERE tenant_id=?1 AND is_tenant_admin=1",
            params![tenant_id],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    pub fn count_tenant_users(&self, tenant_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM tenant_users WHERE tenant_id=?1",
            params![tenant_id],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    /// Refuses to remove the tenant's last tenant-admin (invariant).
    pub fn remove_tenant_user(&self, tenant_id: &str, user_id: &str) -> anyhow::Result<Result<(), &'static str>> {
        let conn = self.conn.lock().unwrap();
        let is_admin: Option<bool> = conn
            .query_row(
                "SELECT is_tenant_admin FROM tenant_users WHERE tenant_id=?1 AND user_id=?2",
                params![tenant_id, user_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(is_admin) = is_admin else {
            return Ok(Err("not_found"));
        };
        if is_admin {
            let admin_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tenant_users WHERE tenant_id=?1 AND is_tenant_admin=1",
                params![tenant_id],
                |r| r.get(0),
            )?;
            if admin_count <= 1 {
                return Ok(Err("last_admin"));
            }
        }
        conn.execute(
            "DELETE FROM tenant_users WHERE tenant_id=?1 AND user_id=?2",
            params![tenant_id, user_id],
        )?;
        Ok(Ok(()))
    }

    pub fn update_tenant_user_role(
        &self,
        tenant_id: &str,
        user_id: &str,
        role: Option<&str>,
        is_tenant_admin: Option<bool>,
    ) -> anyhow::Result<Result<(), &'static str>> {
        let conn = self.conn.lock().unwrap();
        let current: Option<(String, bool)> = conn
            .query_row(
                "SELECT role, is_tenant_admin FROM tenant_users WHERE tenant_id=?1 AND user_id=?2",
                params![tenant_id, user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((cur_role, cur_admin)) = current else {
            return Ok(Err("not_found"));
        };
        let next_admin = is_tenant_admin.unwrap_or(cur_admin);
        if cur_admin && !next_admin {
            let admin_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tenant_users WHERE tenant_id=?1 AND is_tenant_admin=1",
                params![tenant_id],
                |r| r.get(0),
            )?;
            if admin_count <= 1 {
                return Ok(Err("last_admin"));
            }
        }
        conn.execute(
            "UPDATE tenant_users SET role=?3, is_tenant_admin=?4 WHERE tenant_id=?1 AND user_id=?2",
            params![tenant_id, user_id, role.unwrap_or(&cur_role), next_admin],
        )?;
        Ok(Ok(()))
    }

    // ── Refresh tokens ──

    pub fn create_refresh_token(
        &self,
        token: &str,
        user_id: &str,
        tenant_id: Option<&str>,
        expires_at: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO refresh_tokens (token, user_id, tenant_id, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![token, user_id, tenant_id, expires_at],
        )?;
        Ok(())
    }

    pub fn consume_refresh_token(&self, token: &str) -> anyhow::Result<Option<(String, Option<String>)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT user_id, tenant_id, expires_at FROM refresh_tokens WHERE token=?1",
                params![token],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((user_id, tenant_id, expires_at)) = row else {
            return Ok(None);
        };
        conn.execute("DELETE FROM refresh_tokens WHERE token=?1", params![token])?;
        let expires: chrono::DateTime<chrono::Utc> = expires_at.parse()?;
        if expires < chrono::Utc::now() {
            return Ok(None);
        }
        Ok(Some((user_id, tenant_id)))
    }

    // ── Devices ──

    pub fn create_device(&self, d: &Device) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (id, tenant_id, name, device_type, protocol, status, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![d.id, d.tenant_id, d.name, d.device_type, d.protocol, d.status, d.metadata],
        )?;
        Ok(())
    }

    /// Insert-if-under-cap for devices. The count and the insert run under
    /// the same connection mutex so two concurrent creates cannot both see
    /// "one slot remaining".
    pub fn create_device_checked(&self, d: &Device, cap: Option<i64>) -> anyhow::Result<Result<(), &'static str>> {
        let conn = self.conn.lock().unwrap();
        if let Some(cap) = cap {
            let current: i64 = conn.query_row(
                "SELECT COUNT(*) FROM devices WHERE tenant_id=?1",
                params![d.tenant_id],
                |r| r.get(0),
            )?;
            if current >= cap {
                return Ok(Err("quota"));
            }
        }
        conn.execute(
            "INSERT INTO devices (id, tenant_id, name, device_type, protocol, status, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![d.id, d.tenant_id, d.name, d.device_type, d.protocol, d.status, d.metadata],
        )?;
        Ok(Ok(()))
    }

    pub fn get_device(&self, tenant_id: &str, id: &str) -> anyhow::Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, name, device_type, protocol, status, metadata, last_seen_at, created_at
             FROM devices WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
            row_to_device,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Cross-tenant device lookup used only by protocol adapters to resolve
    /// bindings before a tenant context exists (CoAP routing).
    pub fn get_device_any_tenant(&self, id: &str) -> anyhow::Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, name, device_type, protocol, status, metadata, last_seen_at, created_at
             FROM devices WHERE id=?1",
            params![id],
            row_to_device,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Every device across every tenant, used by the OPC UA adapter to seed
    /// its address space at startup (it has no per-tenant endpoint split).
    pub fn list_devices_any_tenant(&self) -> anyhow::Result<Vec<Device>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, device_type, protocol, status, metadata, last_seen_at, created_at
             FROM devices ORDER BY tenant_id, created_at",
        )?;
        let rows = stmt.query_map([], row_to_device)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn list_devices(&self, tenant_id: &str) -> anyhow::Result<Vec<Device>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, device_type, protocol, status, metadata, last_seen_at, created_at
             FROM devices WHERE tenant_id=?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![tenant_id], row_to_device)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_devices(&self, tenant_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE tenant_id=?1",
            params![tenant_id],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    pub fn update_device(
        &self,
        tenant_id: &str,
        id: &str,
        name: Option<&str>,
        device_type: Option<&str>,
        status: Option<&str>,
        metadata: Option<&str>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT id, tenant_id, name, device_type, protocol, status, metadata, last_seen_at, created_at
                 FROM devices WHERE tenant_id=?1 AND id=?2",
                params![tenant_id, id],
                row_to_device,
            )
            .optional()?;
        let Some(d) = existing else { return Ok(false) };
        conn.execute(
            "UPDATE devices SET name=?3, device_type=?4, status=?5, metadata=?6 WHERE tenant_id=?1 AND id=?2",
            params![
                tenant_id,
                id,
                name.unwrap_or(&d.name),
                device_type.unwrap_or(&d.device_type),
                status.unwrap_or(&d.status),
                metadata.unwrap_or(&d.metadata),
            ],
        )?;
        Ok(true)
    }

    /// Refreshed by adapters on every accepted reading.
    pub fn touch_device_status(&self, tenant_id: &str, id: &str, status: &str, seen_at: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET status=?3, last_seen_at=?4 WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id, status, seen_at],
        )?;
        Ok(())
    }

    pub fn delete_device(&self, tenant_id: &str, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM devices WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
        )?;
        Ok(n > 0)
    }

    // ── Quota counters ──

    /// Atomically checks and increments the tenant's telemetry-points-today
    /// counter. Returns `Ok(false)` without mutating if the cap would be
    /// exceeded. The whole read-check-write path runs while holding the
    /// single connection mutex, keeping the critical section short.
    pub fn try_consume_telemetry_quota(
        &self,
        tenant_id: &str,
        day: &str,
        n: i64,
        cap: Option<i64>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let current: i64 = conn
            .query_row(
                "SELECT count FROM telemetry_quota_counters WHERE tenant_id=?1 AND day=?2",
                params![tenant_id, day],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if let Some(cap) = cap {
            if current + n > cap {
                return Ok(false);
            }
        }
        conn.execute(
            "INSERT INTO telemetry_quota_counters (tenant_id, day, count) VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id, day) DO UPDATE SET count = count + ?3",
            params![tenant_id, day, n],
        )?;
        Ok(true)
    }

    pub fn telemetry_count_today(&self, tenant_id: &str, day: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT count FROM telemetry_quota_counters WHERE tenant_id=?1 AND day=?2",
            params![tenant_id, day],
            |r| r.get(0),
        )
        .optional()
        .map(|v| v.unwrap_or(0))
        .map_err(Into::into)
    }

    // ── Rules ──

    pub fn create_rule(&self, r: &RuleRow) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rules (id, tenant_id, name, condition_spec, action_spec, priority, enabled, cooldown_seconds, eval_interval_secs, scope_spec)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![r.id, r.tenant_id, r.name, r.condition_spec, r.action_spec, r.priority, r.enabled, r.cooldown_seconds, r.eval_interval_secs, r.scope_spec],
        )?;
        Ok(())
    }

    pub fn get_rule(&self, tenant_id: &str, id: &str) -> anyhow::Result<Option<RuleRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, name, condition_spec, action_spec, priority, enabled, cooldown_seconds, eval_interval_secs, scope_spec, last_evaluated_at, created_at, updated_at
             FROM rules WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
            row_to_rule,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_rules(&self, tenant_id: &str) -> anyhow::Result<Vec<RuleRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, condition_spec, action_spec, priority, enabled, cooldown_seconds, eval_interval_secs, scope_spec, last_evaluated_at, created_at, updated_at
             FROM rules WHERE tenant_id=?1 ORDER BY priority DESC, created_at",
        )?;
        let rows = stmt.query_map(params![tenant_id], row_to_rule)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// All enabled rules across every tenant whose last evaluation is older
    /// than their own interval; the caller (periodic scheduler) filters by
    /// per-rule interval since that isn't stored as a column split out here.
    pub fn list_enabled_rules(&self) -> anyhow::Result<Vec<RuleRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, condition_spec, action_spec, priority, enabled, cooldown_seconds, eval_interval_secs, scope_spec, last_evaluated_at, created_at, updated_at
             FROM rules WHERE enabled=1",
        )?;
        let rows = stmt.query_map([], row_to_rule)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn update_rule(&self, tenant_id: &str, id: &str, r: &RuleRow) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE rules SET name=?3, condition_spec=?4, action_spec=?5, priority=?6, enabled=?7,
             cooldown_seconds=?8, eval_interval_secs=?9, scope_spec=?10, updated_at=strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE tenant_id=?1 AND id=?2",
            params![
                tenant_id, id, r.name, r.condition_spec, r.action_spec, r.priority, r.enabled,
                r.cooldown_seconds, r.eval_interval_secs, r.scope_spec
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_rule_last_evaluated(&self, id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let last: Option<Option<String>> = conn
            .query_row(
                "SELECT last_evaluated_at FROM rules WHERE id=?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(last.flatten())
    }

    pub fn touch_rule_last_evaluated(&self, id: &str, now: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE rules SET last_evaluated_at=?2 WHERE id=?1",
            params![id, now],
        )?;
        Ok(())
    }

    pub fn delete_rule(&self, tenant_id: &str, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM rules WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
        )?;
        Ok(n > 0)
    }

    /// Latest alert created from `rule_id` for `device_id`, used by the
    /// cooldown check.
    pub fn latest_alert_for_rule_device(
        &self,
        tenant_id: &str,
        rule_id: &str,
        device_id: &str,
    ) -> anyhow::Result<Option<(Alert, String)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Alert, String)> = conn
            .query_row(
                "SELECT a.id, a.tenant_id, a.device_id, a.rule_id, a.severity, a.message, a.created_at,
                        a.metadata, a.escalation_policy_id, a.current_escalation_tier, a.last_escalation_at,
                        a.grouped_alert_id, a.duplicate_count,
                        (SELECT state FROM alert_states WHERE alert_id = a.id ORDER BY changed_at DESC LIMIT 1)
                 FROM alerts a
                 WHERE a.tenant_id=?1 AND a.rule_id=?2 AND a.device_id=?3
                 ORDER BY a.created_at DESC LIMIT 1",
                params![tenant_id, rule_id, device_id],
                |row| {
                    Ok((
                        Alert {
                            id: row.get(0)?,
                            tenant_id: row.get(1)?,
                            device_id: row.get(2)?,
                            rule_id: row.get(3)?,
                            severity: row.get(4)?,
                            message: row.get(5)?,
                            created_at: row.get(6)?,
                            metadata: row.get(7)?,
                            escalation_policy_id: row.get(8)?,
                            current_escalation_tier: row.get(9)?,
                            last_escalation_at: row.get(10)?,
                            grouped_alert_id: row.get(11)?,
                            duplicate_count: row.get(12)?,
                        },
                        row.get(13)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    // ── Alerts & state machine ──

    /// Inserts the alert plus its initial `new` AlertState row atomically;
    /// an alert never exists without its initial state row. The AlertSLA
    /// row lands in the same transaction for representatives only: a
    /// grouped duplicate shadows its representative's response clock, and
    /// giving it an SLA of its own would breach-notify per duplicate
    /// instead of per incident.
    pub fn create_alert(&self, alert: &Alert, tta_target: i64, ttr_target: i64) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO alerts (id, tenant_id, device_id, rule_id, severity, message, created_at, metadata,
             escalation_policy_id, current_escalation_tier, last_escalation_at, grouped_alert_id, duplicate_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                alert.id, alert.tenant_id, alert.device_id, alert.rule_id, alert.severity,
                alert.message, alert.created_at, alert.metadata, alert.escalation_policy_id,
                alert.current_escalation_tier, alert.last_escalation_at, alert.grouped_alert_id,
                alert.duplicate_count
            ],
        )?;
        tx.execute(
            "INSERT INTO alert_states (id, alert_id, state, changed_by, changed_at)
             VALUES (?1, ?2, 'new', 'system', ?3)",
            params![uuid::Uuid::new_v4().to_string(), alert.id, alert.created_at],
        )?;
        if alert.grouped_alert_id.is_none() {
            tx.execute(
                "INSERT INTO alert_slas (alert_id, severity, tta_target_minutes, ttr_target_minutes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![alert.id, alert.severity, tta_target, ttr_target, alert.created_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_alert(&self, tenant_id: &str, id: &str) -> anyhow::Result<Option<Alert>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, device_id, rule_id, severity, message, created_at, metadata,
             escalation_policy_id, current_escalation_tier, last_escalation_at, grouped_alert_id, duplicate_count
             FROM alerts WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
            row_to_alert,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Tenant-agnostic lookup by id, for internal callers that already hold
    /// a validated alert id (the state machine, the escalation executor)
    /// and don't have a tenant-scoped request context handy.
    pub fn get_alert_by_id(&self, id: &str) -> anyhow::Result<Option<Alert>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, device_id, rule_id, severity, message, created_at, metadata,
             escalation_policy_id, current_escalation_tier, last_escalation_at, grouped_alert_id, duplicate_count
             FROM alerts WHERE id=?1",
            params![id],
            row_to_alert,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_alerts(&self, tenant_id: &str) -> anyhow::Result<Vec<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, device_id, rule_id, severity, message, created_at, metadata,
             escalation_policy_id, current_escalation_tier, last_escalation_at, grouped_alert_id, duplicate_count
             FROM alerts WHERE tenant_id=?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![tenant_id], row_to_alert)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_open_alerts(&self, tenant_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM alerts a WHERE a.tenant_id=?1 AND
             (SELECT state FROM alert_states WHERE alert_id=a.id ORDER BY changed_at DESC LIMIT 1) != 'resolved'",
            params![tenant_id],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    pub fn latest_alert_state(&self, alert_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT state FROM alert_states WHERE alert_id=?1 ORDER BY changed_at DESC LIMIT 1",
            params![alert_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_alert_states(&self, alert_id: &str) -> anyhow::Result<Vec<AlertStateRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, alert_id, state, changed_by, changed_at, note FROM alert_states
             WHERE alert_id=?1 ORDER BY changed_at",
        )?;
        let rows = stmt.query_map(params![alert_id], |row| {
            Ok(AlertStateRow {
                id: row.get(0)?,
                alert_id: row.get(1)?,
                state: row.get(2)?,
                changed_by: row.get(3)?,
                changed_at: row.get(4)?,
                note: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Appends a new AlertState row. The caller has already validated the
    /// transition against the current state read under this same mutex
    /// guard's predecessor call, which is what gives "first wins, second
    /// sees a stale precondition" serialization (ordering guarantees).
    pub fn append_alert_state(
        &self,
        alert_id: &str,
        state: &str,
        changed_by: &str,
        changed_at: &str,
        note: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_states (id, alert_id, state, changed_by, changed_at, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![uuid::Uuid::new_v4().to_string(), alert_id, state, changed_by, changed_at, note],
        )?;
        Ok(())
    }

    pub fn set_alert_escalation_policy(&self, alert_id: &str, policy_id: Option<&str>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET escalation_policy_id=?2 WHERE id=?1",
            params![alert_id, policy_id],
        )?;
        Ok(())
    }

    pub fn update_escalation_tier(&self, alert_id: &str, tier: i64, at: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET current_escalation_tier=?2, last_escalation_at=?3 WHERE id=?1",
            params![alert_id, tier, at],
        )?;
        Ok(())
    }

    /// A notification send that exhausted its retries is recorded against
    /// the alert's metadata; the alert's state is never touched by a
    /// delivery failure.
    pub fn record_notification_failure(&self, alert_id: &str, channel: &str, error: &str, at: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let metadata: Option<String> = conn
            .query_row("SELECT metadata FROM alerts WHERE id=?1", params![alert_id], |r| r.get(0))
            .optional()?;
        let Some(metadata) = metadata else { return Ok(()) };
        let mut value: serde_json::Value =
            serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({}));
        let failures = value
            .as_object_mut()
            .map(|o| o.entry("notification_failures").or_insert_with(|| serde_json::json!([])));
        if let Some(serde_json::Value::Array(list)) = failures {
            list.push(serde_json::json!({ "channel": channel, "error": error, "at": at }));
        }
        conn.execute(
            "UPDATE alerts SET metadata=?2 WHERE id=?1",
            params![alert_id, value.to_string()],
        )?;
        Ok(())
    }

    /// Alerts still eligible for escalation, across every tenant: the
    /// executor is a single periodic task, not per-tenant.
    pub fn list_escalatable_alerts(&self) -> anyhow::Result<Vec<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.tenant_id, a.device_id, a.rule_id, a.severity, a.message, a.created_at, a.metadata,
             a.escalation_policy_id, a.current_escalation_tier, a.last_escalation_at, a.grouped_alert_id, a.duplicate_count
             FROM alerts a
             WHERE a.escalation_policy_id IS NOT NULL
               AND (SELECT state FROM alert_states WHERE alert_id=a.id ORDER BY changed_at DESC LIMIT 1) IN ('new','investigating')",
        )?;
        let rows = stmt.query_map([], row_to_alert)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ── SLA ──

    pub fn get_alert_sla(&self, alert_id: &str) -> anyhow::Result<Option<AlertSla>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT alert_id, severity, tta_target_minutes, ttr_target_minutes, tta_actual, ttr_actual,
             tta_breached, ttr_breached, tta_breach_notified, ttr_breach_notified, created_at
             FROM alert_slas WHERE alert_id=?1",
            params![alert_id],
            row_to_sla,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update_sla_tta(&self, alert_id: &str, tta_actual: f64, breached: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_slas SET tta_actual=?2, tta_breached=?3 WHERE alert_id=?1",
            params![alert_id, tta_actual, breached],
        )?;
        Ok(())
    }

    pub fn update_sla_ttr(&self, alert_id: &str, ttr_actual: f64, breached: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_slas SET ttr_actual=?2, ttr_breached=?3 WHERE alert_id=?1",
            params![alert_id, ttr_actual, breached],
        )?;
        Ok(())
    }

    /// Open alerts (not resolved) paired with their SLA row and current
    /// state, for the periodic breach monitor. Grouped duplicates are
    /// excluded: only the representative carries the incident's response
    /// clock.
    pub fn list_open_alerts_with_sla(&self) -> anyhow::Result<Vec<(Alert, AlertSla, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.tenant_id, a.device_id, a.rule_id, a.severity, a.message, a.created_at, a.metadata,
             a.escalation_policy_id, a.current_escalation_tier, a.last_escalation_at, a.grouped_alert_id, a.duplicate_count,
             s.alert_id, s.severity, s.tta_target_minutes, s.ttr_target_minutes, s.tta_actual, s.ttr_actual,
             s.tta_breached, s.ttr_breached, s.tta_breach_notified, s.ttr_breach_notified, s.created_at,
             (SELECT state FROM alert_states WHERE alert_id=a.id ORDER BY changed_at DESC LIMIT 1)
             FROM alerts a JOIN alert_slas s ON s.alert_id = a.id
             WHERE a.grouped_alert_id IS NULL
               AND (SELECT state FROM alert_states WHERE alert_id=a.id ORDER BY changed_at DESC LIMIT 1) != 'resolved'",
        )?;
        let rows = stmt.query_map([], |row| {
            let alert = Alert {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                device_id: row.get(2)?,
                rule_id: row.get(3)?,
                severity: row.get(4)?,
                message: row.get(5)?,
                created_at: row.get(6)?,
                metadata: row.get(7)?,
                escalation_policy_id: row.get(8)?,
                current_escalation_tier: row.get(9)?,
                last_escalation_at: row.get(10)?,
                grouped_alert_id: row.get(11)?,
                duplicate_count: row.get(12)?,
            };
            let sla = AlertSla {
                alert_id: row.get(13)?,
                severity: row.get(14)?,
                tta_target_minutes: row.get(15)?,
                ttr_target_minutes: row.get(16)?,
                tta_actual: row.get(17)?,
                ttr_actual: row.get(18)?,
                tta_breached: row.get(19)?,
                ttr_breached: row.get(20)?,
                tta_breach_notified: row.get(21)?,
                ttr_breach_notified: row.get(22)?,
                created_at: row.get(23)?,
            };
            let state: String = row.get(24)?;
            Ok((alert, sla, state))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn mark_tta_breach_notified(&self, alert_id: &str, breached: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_slas SET tta_breached=?2, tta_breach_notified=1 WHERE alert_id=?1",
            params![alert_id, breached],
        )?;
        Ok(())
    }

    pub fn mark_ttr_breach_notified(&self, alert_id: &str, breached: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_slas SET ttr_breached=?2, ttr_breach_notified=1 WHERE alert_id=?1",
            params![alert_id, breached],
        )?;
        Ok(())
    }

    // ── Grouping ──

    /// Atomic find-or-create against the active-group partial unique index.
    /// Returns the representative alert id and whether this call created a
    /// new group.
    pub fn upsert_alert_group(
        &self,
        tenant_id: &str,
        device_id: &str,
        rule_id: Option<&str>,
        severity: &str,
        group_key: &str,
        now: &str,
        window_secs: i64,
        new_alert_id: &str,
    ) -> anyhow::Result<(String, bool)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let existing: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT id, last_occurrence_at, occurrence_count FROM alert_groups
                 WHERE tenant_id=?1 AND group_key=?2 AND status='active'",
                params![tenant_id, group_key],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;

        if let Some((group_id, last_occurrence_at, count)) = existing {
            let last: chrono::DateTime<chrono::Utc> = last_occurrence_at.parse()?;
            let now_dt: chrono::DateTime<chrono::Utc> = now.parse()?;
            if (now_dt - last).num_seconds() <= window_secs {
                tx.execute(
                    "UPDATE alert_groups SET last_occurrence_at=?2, occurrence_count=?3 WHERE id=?1",
                    params![group_id, now, count + 1],
                )?;
                let representative: String = tx.query_row(
                    "SELECT representative_alert_id FROM alert_groups WHERE id=?1",
                    params![group_id],
                    |r| r.get(0),
                )?;
                tx.execute(
                    "UPDATE alerts SET duplicate_count = duplicate_count + 1 WHERE id=?1",
                    params![representative],
                )?;
                tx.commit()?;
                return Ok((representative, false));
            }
            // Window elapsed: close the stale group and fall through to create a new one.
            tx.execute("UPDATE alert_groups SET status='closed' WHERE id=?1", params![group_id])?;
        }

        let group_id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO alert_groups (id, tenant_id, device_id, rule_id, severity, group_key,
             first_occurrence_at, last_occurrence_at, occurrence_count, status, representative_alert_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1, 'active', ?8)",
            params![group_id, tenant_id, device_id, rule_id, severity, group_key, now, new_alert_id],
        )?;
        tx.commit()?;
        Ok((new_alert_id.to_string(), true))
    }

    pub fn list_alert_groups(&self, tenant_id: &str) -> anyhow::Result<Vec<AlertGroup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, device_id, rule_id, severity, first_occurrence_at, last_occurrence_at,
             occurrence_count, status, representative_alert_id
             FROM alert_groups WHERE tenant_id=?1 ORDER BY last_occurrence_at DESC",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| {
            Ok(AlertGroup {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                device_id: row.get(2)?,
                rule_id: row.get(3)?,
                severity: row.get(4)?,
                first_occurrence_at: row.get(5)?,
                last_occurrence_at: row.get(6)?,
                occurrence_count: row.get(7)?,
                status: row.get(8)?,
                representative_alert_id: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ── Escalation policies ──

    pub fn create_escalation_policy(&self, p: &EscalationPolicyRow) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO escalation_policies (id, tenant_id, name, tiers_spec, severity_filter)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![p.id, p.tenant_id, p.name, p.tiers_spec, p.severity_filter],
        )?;
        Ok(())
    }

    pub fn get_escalation_policy(&self, tenant_id: &str, id: &str) -> anyhow::Result<Option<EscalationPolicyRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, name, tiers_spec, severity_filter, created_at FROM escalation_policies
             WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
            row_to_policy,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_escalation_policies(&self, tenant_id: &str) -> anyhow::Result<Vec<EscalationPolicyRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, tiers_spec, severity_filter, created_at FROM escalation_policies
             WHERE tenant_id=?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![tenant_id], row_to_policy)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// First policy whose `severity_filter` (JSON array) names `severity`.
    pub fn find_policy_for_severity(&self, tenant_id: &str, severity: &str) -> anyhow::Result<Option<EscalationPolicyRow>> {
        let policies = self.list_escalation_policies(tenant_id)?;
        Ok(policies.into_iter().find(|p| {
            serde_json::from_str::<Vec<String>>(&p.severity_filter)
                .map(|filters| filters.iter().any(|f| f == severity))
                .unwrap_or(false)
        }))
    }

    pub fn delete_escalation_policy(&self, tenant_id: &str, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM escalation_policies WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
        )?;
        Ok(n > 0)
    }

    // ── On-call schedules ──

    pub fn create_on_call_schedule(&self, s: &OnCallScheduleRow) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO on_call_schedules (id, tenant_id, name, rotation_spec, overrides_spec, timezone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![s.id, s.tenant_id, s.name, s.rotation_spec, s.overrides_spec, s.timezone],
        )?;
        Ok(())
    }

    pub fn get_on_call_schedule(&self, tenant_id: &str, id: &str) -> anyhow::Result<Option<OnCallScheduleRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tenant_id, name, rotation_spec, overrides_spec, timezone, created_at
             FROM on_call_schedules WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
            row_to_schedule,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_on_call_schedules(&self, tenant_id: &str) -> anyhow::Result<Vec<OnCallScheduleRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, rotation_spec, overrides_spec, timezone, created_at
             FROM on_call_schedules WHERE tenant_id=?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![tenant_id], row_to_schedule)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn update_on_call_schedule(&self, tenant_id: &str, id: &str, s: &OnCallScheduleRow) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE on_call_schedules SET name=?3, rotation_spec=?4, overrides_spec=?5, timezone=?6
             WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id, s.name, s.rotation_spec, s.overrides_spec, s.timezone],
        )?;
        Ok(n > 0)
    }

    pub fn delete_on_call_schedule(&self, tenant_id: &str, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM on_call_schedules WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
        )?;
        Ok(n > 0)
    }

    // ── Notification channels ──

    pub fn create_channel(&self, id: &str, tenant_id: &str, name: &str, channel_type: &str, config: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notification_channels (id, tenant_id, name, channel_type, config) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, tenant_id, name, channel_type, config],
        )?;
        Ok(())
    }

    pub fn get_channel_by_name(&self, tenant_id: &str, name: &str) -> anyhow::Result<Option<(String, String, String)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, channel_type, config FROM notification_channels WHERE tenant_id=?1 AND name=?2",
            params![tenant_id, name],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_channels(&self, tenant_id: &str) -> anyhow::Result<Vec<(String, String, String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, channel_type, config FROM notification_channels WHERE tenant_id=?1",
        )?;
        let rows = stmt.query_map(params![tenant_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn delete_channel(&self, tenant_id: &str, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM notification_channels WHERE tenant_id=?1 AND id=?2",
            params![tenant_id, id],
        )?;
        Ok(n > 0)
    }
}

fn row_to_tenant(row: &rusqlite::Row) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        tier: row.get(3)?,
        max_devices: row.get(4)?,
        max_users: row.get(5)?,
        max_telemetry_points_per_day: row.get(6)?,
        max_retention_days: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_verifier: row.get(2)?,
        is_system_admin: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_tenant_user(row: &rusqlite::Row) -> rusqlite::Result<TenantUser> {
    Ok(TenantUser {
        tenant_id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        is_tenant_admin: row.get(3)?,
        joined_at: row.get(4)?,
    })
}

fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        device_type: row.get(3)?,
        protocol: row.get(4)?,
        status: row.get(5)?,
        metadata: row.get(6)?,
        last_seen_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<RuleRow> {
    Ok(RuleRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        condition_spec: row.get(3)?,
        action_spec: row.get(4)?,
        priority: row.get(5)?,
        enabled: row.get(6)?,
        cooldown_seconds: row.get(7)?,
        eval_interval_secs: row.get(8)?,
        scope_spec: row.get(9)?,
        last_evaluated_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        device_id: row.get(2)?,
        rule_id: row.get(3)?,
        severity: row.get(4)?,
        message: row.get(5)?,
        created_at: row.get(6)?,
        metadata: row.get(7)?,
        escalation_policy_id: row.get(8)?,
        current_escalation_tier: row.get(9)?,
        last_escalation_at: row.get(10)?,
        grouped_alert_id: row.get(11)?,
        duplicate_count: row.get(12)?,
    })
}

fn row_to_sla(row: &rusqlite::Row) -> rusqlite::Result<AlertSla> {
    Ok(AlertSla {
        alert_id: row.get(0)?,
        severity: row.get(1)?,
        tta_target_minutes: row.get(2)?,
        ttr_target_minutes: row.get(3)?,
        tta_actual: row.get(4)?,
        ttr_actual: row.get(5)?,
        tta_breached: row.get(6)?,
        ttr_breached: row.get(7)?,
        tta_breach_notified: row.get(8)?,
        ttr_breach_notified: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn row_to_policy(row: &rusqlite::Row) -> rusqlite::Result<EscalationPolicyRow> {
    Ok(EscalationPolicyRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        tiers_spec: row.get(3)?,
        severity_filter: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<OnCallScheduleRow> {
    Ok(OnCallScheduleRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        rotation_spec: row.get(3)?,
        overrides_spec: row.get(4)?,
        timezone: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tenant() -> Tenant {
        Tenant {
            id: "t1".into(),
            slug: "acme".into(),
            name: "Acme".into(),
            tier: "professional".into(),
            max_devices: Some(10),
            max_users: None,
            max_telemetry_points_per_day: Some(1000),
            max_retention_days: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn create_and_fetch_tenant() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&sample_tenant()).unwrap();
        let fetched = db.get_tenant_by_slug("acme").unwrap().unwrap();
        assert_eq!(fetched.name, "Acme");
        assert_eq!(fetched.max_devices, Some(10));
    }

    #[test]
    fn quota_blocks_past_cap() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&sample_tenant()).unwrap();
        assert!(db.try_consume_telemetry_quota("t1", "2026-01-01", 900, Some(1000)).unwrap());
        assert!(!db.try_consume_telemetry_quota("t1", "2026-01-01", 200, Some(1000)).unwrap());
        assert_eq!(db.telemetry_count_today("t1", "2026-01-01").unwrap(), 900);
    }

    #[test]
    fn last_tenant_admin_cannot_be_removed() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&sample_tenant()).unwrap();
        db.create_user(&User {
            id: "u1".into(),
            email: "a@acme.test".into(),
            password_verifier: "x".into(),
            is_system_admin: false,
            created_at: String::new(),
        })
        .unwrap();
        db.create_tenant_user(&TenantUser {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            role: "admin".into(),
            is_tenant_admin: true,
            joined_at: String::new(),
        })
        .unwrap();
        let result = db.remove_tenant_user("t1", "u1").unwrap();
        assert_eq!(result, Err("last_admin"));
    }

    #[test]
    fn tenant_scoped_reads_never_cross_tenants() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&sample_tenant()).unwrap();
        db.create_tenant(&Tenant {
            id: "t2".into(),
            slug: "globex".into(),
            name: "Globex".into(),
            tier: "free".into(),
            max_devices: None,
            max_users: None,
            max_telemetry_points_per_day: None,
            max_retention_days: None,
            created_at: String::new(),
            updated_at: String::new(),
        })
        .unwrap();
        db.create_device(&sample_device("d1")).unwrap();

        assert!(db.get_device("t2", "d1").unwrap().is_none());
        assert!(db.list_devices("t2").unwrap().is_empty());
        assert!(!db.delete_device("t2", "d1").unwrap());
        assert!(db.get_device("t1", "d1").unwrap().is_some());
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("insa.db");
        let path = path.to_str().unwrap();
        {
            let db = ConfigDb::open(path).unwrap();
            db.create_tenant(&sample_tenant()).unwrap();
        }
        let db = ConfigDb::open(path).unwrap();
        assert!(db.get_tenant("t1").unwrap().is_some());
    }

    fn sample_device(id: &str) -> Device {
        Device {
            id: id.into(),
            tenant_id: "t1".into(),
            name: id.into(),
            device_type: "sensor".into(),
            protocol: "mqtt".into(),
            status: "offline".into(),
            metadata: "{}".into(),
            last_seen_at: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn device_cap_blocks_at_limit() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&sample_tenant()).unwrap();
        assert_eq!(db.create_device_checked(&sample_device("d1"), Some(1)).unwrap(), Ok(()));
        assert_eq!(db.create_device_checked(&sample_device("d2"), Some(1)).unwrap(), Err("quota"));
        assert_eq!(db.count_devices("t1").unwrap(), 1);
    }

    #[test]
    fn group_key_unique_while_active() {
        let db = ConfigDb::open_in_memory().unwrap();
        db.create_tenant(&sample_tenant()).unwrap();
        let now = "2026-01-01T00:00:00Z";
        let (rep1, created1) = db
            .upsert_alert_group("t1", "d1", Some("r1"), "high", "d1|r1|high", now, 300, "a1")
            .unwrap();
        assert!(created1);
        assert_eq!(rep1, "a1");
        let (rep2, created2) = db
            .upsert_alert_group("t1", "d1", Some("r1"), "high", "d1|r1|high", now, 300, "a2")
            .unwrap();
        assert!(!created2);
        assert_eq!(rep2, "a1");
    }
}
