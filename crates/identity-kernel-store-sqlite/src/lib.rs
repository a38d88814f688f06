use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use identity_kernel_core::{
    audit_invariants, consolidate, ContactId, ContactLedger, ContactRecord, ContactRole,
    ConsolidatedContact, IdentifyRequest, InvariantViolation, KernelError, NewContact,
    Reconciliation,
};
use rusqlite::{
    params, Connection, DatabaseName, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 1;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone TEXT,
  parent_id INTEGER REFERENCES contacts(id),
  role TEXT NOT NULL CHECK (role IN ('root', 'member')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (
    (role = 'root' AND parent_id IS NULL)
    OR (role = 'member' AND parent_id IS NOT NULL AND parent_id <> id)
  )
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone);
CREATE INDEX IF NOT EXISTS idx_contacts_parent_id ON contacts(parent_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone, parent_id, role, created_at, updated_at, deleted_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub invariant_violations: Vec<InvariantViolation>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.invariant_violations.is_empty()
            && self.schema_status.pending_versions.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyImportSummary {
    pub imported_contacts: usize,
    pub promoted_orphans: usize,
    pub flattened_members: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// `busy_timeout` bounds how long a reconciliation waits for the write lock
    /// before failing with a retryable conflict.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(busy_timeout).context("failed to configure sqlite busy timeout")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// A database still in the legacy `Contact` layout is imported into
    /// `contacts` as part of migration 1; the legacy table is left in place.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;

        if has_legacy_contact_table(&tx)? && count_contacts(&tx)? == 0 {
            let summary = import_legacy_contacts(&tx)?;
            tracing::info!(
                imported = summary.imported_contacts,
                promoted_orphans = summary.promoted_orphans,
                flattened_members = summary.flattened_members,
                "imported legacy Contact table"
            );
        }

        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Run one reconciliation as a single `BEGIN IMMEDIATE` unit of work.
    ///
    /// The write lock is taken before the first read, so concurrent callers that
    /// would both see "no match" are serialized. The transaction commits once on
    /// success and rolls back on any error.
    ///
    /// # Errors
    /// Returns an error wrapping [`KernelError`]: `Conflict` when the write lock
    /// could not be acquired within the busy timeout, `Validation`, `Integrity`
    /// or `Storage` otherwise.
    pub fn reconcile(
        &mut self,
        request: &IdentifyRequest,
        now: OffsetDateTime,
    ) -> Result<Reconciliation> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| classify(&err, "failed to begin reconciliation transaction"))
            .inspect_err(log_conflict)?;

        let mut ledger = SqliteLedger { conn: &tx };
        let outcome = identity_kernel_core::reconcile(&mut ledger, request, now)
            .inspect_err(log_conflict)?;

        tx.commit()
            .map_err(|err| classify(&err, "failed to commit reconciliation"))
            .inspect_err(log_conflict)?;
        Ok(outcome)
    }

    /// Every stored record, soft-deleted ones included, ordered by id.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY id ASC"))
            .context("failed to prepare contact listing")?;
        let rows = stmt.query_map([], ContactRow::from_row).context("failed to list contacts")?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("failed to read contact row")?.into_record()?);
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn get_contact(&self, id: ContactId) -> Result<Option<ContactRecord>> {
        SqliteLedger { conn: &self.conn }.get(id).map_err(anyhow::Error::new)
    }

    /// Consolidated view of the live group containing `id`, or `None` when the
    /// record is unknown or deleted.
    ///
    /// # Errors
    /// Returns an error when reads fail or the group has no readable root.
    pub fn group_for_contact(&self, id: ContactId) -> Result<Option<ConsolidatedContact>> {
        let ledger = SqliteLedger { conn: &self.conn };
        let Some(record) = ledger.get(id)?.filter(|record| !record.is_deleted()) else {
            return Ok(None);
        };
        let root_id = record.effective_root_id().unwrap_or(record.id);
        let group = ledger.find_group(root_id)?;
        let contact = consolidate(root_id, &group)
            .with_context(|| format!("failed to consolidate group for contact {id}"))?;
        Ok(Some(contact))
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, the identity invariant audit, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let contacts_present = table_exists(&self.conn, "contacts")?;
        let foreign_key_violations = if contacts_present {
            contact_foreign_key_violations(&self.conn)?
        } else {
            Vec::new()
        };
        let invariant_violations = if contacts_present {
            audit_invariants(&self.list_contacts()?)
        } else {
            Vec::new()
        };
        for violation in &invariant_violations {
            tracing::error!(
                kind = violation.kind.as_str(),
                contact_ids = ?violation.contact_ids,
                detail = %violation.detail,
                "identity invariant violated"
            );
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            invariant_violations,
            schema_status,
        })
    }
}

/// [`ContactLedger`] over a connection that already holds the unit-of-work transaction.
struct SqliteLedger<'conn> {
    conn: &'conn Connection,
}

impl SqliteLedger<'_> {
    fn query_records(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ContactRecord>, KernelError> {
        let mut stmt = self.conn.prepare(sql).map_err(|err| classify(&err, "prepare"))?;
        let rows = stmt
            .query_map(params, ContactRow::from_row)
            .map_err(|err| classify(&err, "query contacts"))?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|err| classify(&err, "read contact row"))?;
            let record =
                row.into_record().map_err(|err| KernelError::Storage(format!("{err:#}")))?;
            records.push(record);
        }
        Ok(records)
    }
}

impl ContactLedger for SqliteLedger<'_> {
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<ContactRecord>, KernelError> {
        self.query_records(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL
                   AND ((?1 IS NOT NULL AND email = ?1) OR (?2 IS NOT NULL AND phone = ?2))
                 ORDER BY created_at ASC, id ASC"
            ),
            &[&email, &phone],
        )
    }

    fn find_group(&self, root_id: ContactId) -> Result<Vec<ContactRecord>, KernelError> {
        self.query_records(
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND (id = ?1 OR parent_id = ?1)
                 ORDER BY created_at ASC, id ASC"
            ),
            &[&root_id.0],
        )
    }

    fn get(&self, id: ContactId) -> Result<Option<ContactRecord>, KernelError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.0],
                ContactRow::from_row,
            )
            .optional()
            .map_err(|err| classify(&err, "load contact"))?;

        row.map(ContactRow::into_record)
            .transpose()
            .map_err(|err| KernelError::Storage(format!("{err:#}")))
    }

    fn insert(
        &mut self,
        contact: NewContact,
        now: OffsetDateTime,
    ) -> Result<ContactRecord, KernelError> {
        let stamp = timestamp(now).map_err(|err| KernelError::Storage(format!("{err:#}")))?;
        self.conn
            .execute(
                "INSERT INTO contacts(email, phone, parent_id, role, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    contact.email,
                    contact.phone,
                    contact.parent_id.map(|id| id.0),
                    contact.role().as_str(),
                    stamp,
                ],
            )
            .map_err(|err| classify(&err, "insert contact"))?;

        let id = ContactId(self.conn.last_insert_rowid());
        self.get(id)?
            .ok_or_else(|| KernelError::Storage(format!("inserted contact {id} is not readable")))
    }

    fn demote(
        &mut self,
        id: ContactId,
        parent_id: ContactId,
        now: OffsetDateTime,
    ) -> Result<(), KernelError> {
        let stamp = timestamp(now).map_err(|err| KernelError::Storage(format!("{err:#}")))?;
        let changed = self
            .conn
            .execute(
                "UPDATE contacts SET role = 'member', parent_id = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id.0, parent_id.0, stamp],
            )
            .map_err(|err| classify(&err, "demote contact"))?;
        if changed == 0 {
            return Err(KernelError::Integrity(format!("contact {id} not found")));
        }
        Ok(())
    }

    fn reparent_members(
        &mut self,
        from: ContactId,
        to: ContactId,
        now: OffsetDateTime,
    ) -> Result<usize, KernelError> {
        let stamp = timestamp(now).map_err(|err| KernelError::Storage(format!("{err:#}")))?;
        self.conn
            .execute(
                "UPDATE contacts SET parent_id = ?2, updated_at = ?3
                 WHERE parent_id = ?1 AND deleted_at IS NULL",
                params![from.0, to.0, stamp],
            )
            .map_err(|err| classify(&err, "re-parent members"))
    }
}

struct ContactRow {
    id: i64,
    email: Option<String>,
    phone: Option<String>,
    parent_id: Option<i64>,
    role: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl ContactRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            phone: row.get(2)?,
            parent_id: row.get(3)?,
            role: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<ContactRecord> {
        let role = ContactRole::parse(&self.role)
            .ok_or_else(|| anyhow!("contact {} has invalid role {}", self.id, self.role))?;
        Ok(ContactRecord {
            id: ContactId(self.id),
            email: self.email,
            phone: self.phone,
            parent_id: self.parent_id.map(ContactId),
            role,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

/// Busy and locked failures are transient; everything else is a storage fault.
fn classify(err: &rusqlite::Error, action: &str) -> KernelError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            KernelError::Conflict(format!("{action}: {err}"))
        }
        _ => KernelError::Storage(format!("{action}: {err}")),
    }
}

fn log_conflict(err: &KernelError) {
    if err.is_retryable() {
        tracing::warn!(error = %err, "reconciliation hit a retryable conflict");
    }
}

/// Only `contacts` is probed; a leftover legacy `Contact` table may still hold
/// links its writer never enforced.
fn contact_foreign_key_violations(conn: &Connection) -> Result<Vec<ForeignKeyViolation>> {
    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check(contacts)")
        .context("failed to prepare PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?;

    let mut violations = Vec::new();
    for row in rows {
        violations.push(row?);
    }
    Ok(violations)
}

fn has_legacy_contact_table(conn: &Connection) -> Result<bool> {
    Ok(table_exists(conn, "Contact")? && table_has_column(conn, "Contact", "linkPrecedence")?)
}

fn count_contacts(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))
        .context("failed to count contacts")
}

struct LegacyRow {
    id: i64,
    email: Option<String>,
    phone: Option<String>,
    linked_id: Option<i64>,
    secondary: bool,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl LegacyRow {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        let precedence: String = row.get(4)?;
        let deleted_at = row.get::<_, Option<String>>(7)?.map(|raw| legacy_timestamp(Some(raw)));
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            phone: row.get(2)?,
            linked_id: row.get(3)?,
            secondary: precedence == "secondary",
            created_at: legacy_timestamp(row.get(5)?)?,
            updated_at: legacy_timestamp(row.get(6)?)?,
            deleted_at: deleted_at.transpose()?,
        })
    }
}

/// The legacy row `id` should hang under once chains are collapsed; `None` for roots.
///
/// A secondary whose `linkedId` is missing, points at itself, or names an absent
/// row ends the chain as a root. A chain that loops back on itself is rooted at
/// the smallest id in the loop.
fn legacy_top_root(rows: &BTreeMap<i64, LegacyRow>, id: i64) -> Option<i64> {
    let next = |current: i64| {
        rows.get(&current)
            .filter(|row| row.secondary)
            .and_then(|row| row.linked_id)
            .filter(|linked| *linked != current && rows.contains_key(linked))
    };

    let mut path = vec![id];
    let mut current = id;
    let top = loop {
        let Some(linked) = next(current) else {
            break current;
        };
        if let Some(position) = path.iter().position(|seen| *seen == linked) {
            break path[position..].iter().copied().min().unwrap_or(linked);
        }
        path.push(linked);
        current = linked;
    };
    (top != id).then_some(top)
}

/// Copy the legacy `Contact` rows into `contacts`, keeping ids.
///
/// Members are re-pointed at the top of their legacy chain so every group is one
/// level deep. Secondaries with no reachable parent come across as roots.
fn import_legacy_contacts(conn: &Connection) -> Result<LegacyImportSummary> {
    conn.execute_batch("PRAGMA defer_foreign_keys = ON;")
        .context("failed to defer foreign keys for legacy import")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, email, phoneNumber, linkedId, linkPrecedence, createdAt, updatedAt, deletedAt
             FROM Contact ORDER BY id ASC",
        )
        .context("failed to prepare legacy Contact scan")?;
    let mut scan = stmt.query([]).context("failed to scan legacy Contact table")?;
    let mut rows = BTreeMap::new();
    while let Some(row) = scan.next()? {
        let legacy = LegacyRow::from_row(row)?;
        rows.insert(legacy.id, legacy);
    }

    let mut summary =
        LegacyImportSummary { imported_contacts: 0, promoted_orphans: 0, flattened_members: 0 };
    for legacy in rows.values() {
        let parent_id = legacy_top_root(&rows, legacy.id);
        let role = match parent_id {
            Some(parent) => {
                if legacy.linked_id != Some(parent) {
                    summary.flattened_members += 1;
                }
                ContactRole::Member
            }
            None => {
                if legacy.secondary {
                    summary.promoted_orphans += 1;
                }
                ContactRole::Root
            }
        };

        conn.execute(
            "INSERT INTO contacts(id, email, phone, parent_id, role, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                legacy.id,
                legacy.email,
                legacy.phone,
                parent_id,
                role.as_str(),
                legacy.created_at,
                legacy.updated_at,
                legacy.deleted_at,
            ],
        )
        .with_context(|| format!("failed to import legacy contact {}", legacy.id))?;
        summary.imported_contacts += 1;
    }

    Ok(summary)
}

/// Legacy rows carry either SQLite `CURRENT_TIMESTAMP` text or RFC3339.
fn legacy_timestamp(raw: Option<String>) -> Result<String> {
    let Some(raw) = raw else {
        return timestamp(OffsetDateTime::UNIX_EPOCH);
    };
    if let Ok(value) = parse_timestamp(&raw) {
        return timestamp(value);
    }
    let value = PrimitiveDateTime::parse(
        &raw,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .with_context(|| format!("invalid legacy timestamp: {raw}"))?
    .assume_utc();
    timestamp(value)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_has_column(conn, "contacts", "parent_id")? {
        return Ok((1, true));
    }

    Ok((0, has_legacy_contact_table(conn)?))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = timestamp(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

/// Fixed-width UTC RFC3339 with nanoseconds, so text order matches time order.
fn timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .context("failed to format timestamp")
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use identity_kernel_core::{AnomalyKind, ViolationKind};
    use time::Duration as TimeDuration;
    use ulid::Ulid;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + TimeDuration::seconds(1_700_000_000)
    }

    fn at(step: i64) -> OffsetDateTime {
        fixture_time() + TimeDuration::seconds(step)
    }

    fn memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn identify(
        store: &mut SqliteStore,
        email: Option<&str>,
        phone: Option<&str>,
        step: i64,
    ) -> Result<Reconciliation> {
        store.reconcile(&IdentifyRequest::new(email, phone), at(step))
    }

    fn ids(values: &[i64]) -> Vec<ContactId> {
        values.iter().copied().map(ContactId).collect()
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("identitykernel-{label}-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: TDB-001
    #[test]
    fn migrate_is_idempotent_and_reports_latest_version() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        assert!(!after.inferred_from_legacy);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn sqlite_constraints_enforce_role_parent_pairing_and_foreign_keys() -> Result<()> {
        let store = memory_store()?;
        let stamp = timestamp(fixture_time())?;

        let root_with_parent = store.conn.execute(
            "INSERT INTO contacts(email, role, parent_id, created_at, updated_at)
             VALUES ('a@x.com', 'root', NULL, ?1, ?1)",
            params![stamp],
        );
        assert!(root_with_parent.is_ok());

        let bad_role = store.conn.execute(
            "INSERT INTO contacts(email, role, created_at, updated_at)
             VALUES ('b@x.com', 'primary', ?1, ?1)",
            params![stamp],
        );
        assert!(bad_role.is_err());

        let member_without_parent = store.conn.execute(
            "INSERT INTO contacts(email, role, created_at, updated_at)
             VALUES ('c@x.com', 'member', ?1, ?1)",
            params![stamp],
        );
        assert!(member_without_parent.is_err());

        let root_pointing_up = store.conn.execute(
            "INSERT INTO contacts(email, role, parent_id, created_at, updated_at)
             VALUES ('d@x.com', 'root', 1, ?1, ?1)",
            params![stamp],
        );
        assert!(root_pointing_up.is_err());

        let dangling_parent = store.conn.execute(
            "INSERT INTO contacts(email, role, parent_id, created_at, updated_at)
             VALUES ('e@x.com', 'member', 999, ?1, ?1)",
            params![stamp],
        );
        assert!(dangling_parent.is_err());
        Ok(())
    }

    // Test IDs: TREC-001
    #[test]
    fn reconcile_walks_the_canonical_scenarios() -> Result<()> {
        let mut store = memory_store()?;

        let first = identify(&mut store, Some("a@x.com"), Some("100"), 0)?;
        assert_eq!(first.contact.primary_id, ContactId(1));
        assert_eq!(first.contact.emails, vec!["a@x.com"]);
        assert_eq!(first.contact.phones, vec!["100"]);
        assert!(first.contact.member_ids.is_empty());

        let second = identify(&mut store, Some("b@x.com"), Some("100"), 1)?;
        assert_eq!(second.contact.emails, vec!["a@x.com", "b@x.com"]);
        assert_eq!(second.contact.member_ids, ids(&[2]));

        let lookup = identify(&mut store, Some("b@x.com"), None, 2)?;
        assert_eq!(lookup.contact, second.contact);
        assert_eq!(lookup.created_contact_id, None);

        let third = identify(&mut store, Some("c@x.com"), Some("200"), 3)?;
        assert_eq!(third.contact.primary_id, ContactId(3));

        let merged = identify(&mut store, Some("c@x.com"), Some("100"), 4)?;
        assert_eq!(merged.contact.primary_id, ContactId(1));
        assert_eq!(merged.contact.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(merged.contact.phones, vec!["100", "200"]);
        assert_eq!(merged.contact.member_ids, ids(&[2, 3, 4]));

        let repeated = identify(&mut store, Some("c@x.com"), Some("100"), 5)?;
        assert_eq!(repeated.contact, merged.contact);
        assert_eq!(repeated.created_contact_id, None);
        assert_eq!(store.list_contacts()?.len(), 4);

        let demoted = store.get_contact(ContactId(3))?;
        assert_eq!(demoted.as_ref().map(|record| record.role), Some(ContactRole::Member));
        assert_eq!(demoted.and_then(|record| record.parent_id), Some(ContactId(1)));
        Ok(())
    }

    // Test IDs: TREC-002
    #[test]
    fn merge_cascades_members_and_keeps_invariants() -> Result<()> {
        let mut store = memory_store()?;
        identify(&mut store, Some("a@x.com"), Some("100"), 0)?;
        identify(&mut store, Some("c@x.com"), Some("200"), 1)?;
        identify(&mut store, Some("d@x.com"), Some("200"), 2)?;

        let merged = identify(&mut store, Some("a@x.com"), Some("200"), 3)?;
        assert_eq!(merged.contact.member_ids, ids(&[2, 3, 4]));
        assert_eq!(merged.merge.map(|report| report.reparented), Some(1));

        let report = store.integrity_check()?;
        assert!(report.is_healthy(), "unexpected integrity report: {report:?}");
        Ok(())
    }

    // Test IDs: TREC-003
    #[test]
    fn sub_second_ordering_survives_storage() -> Result<()> {
        let mut store = memory_store()?;
        let base = fixture_time();
        store.reconcile(
            &IdentifyRequest::new(Some("late@x.com"), Some("1")),
            base + TimeDuration::milliseconds(900),
        )?;
        store.reconcile(
            &IdentifyRequest::new(Some("early@x.com"), Some("2")),
            base + TimeDuration::milliseconds(5),
        )?;

        let merged =
            store.reconcile(&IdentifyRequest::new(Some("late@x.com"), Some("2")), at(10))?;
        assert_eq!(merged.contact.primary_id, ContactId(2));
        Ok(())
    }

    // Test IDs: TREC-004
    #[test]
    fn failed_merge_rolls_back_every_write() -> Result<()> {
        let mut store = memory_store()?;
        identify(&mut store, Some("a@x.com"), Some("100"), 0)?;
        identify(&mut store, Some("b@x.com"), Some("200"), 1)?;
        store.conn.execute_batch(
            "CREATE TRIGGER refuse_reparent BEFORE UPDATE OF parent_id ON contacts
             WHEN OLD.role = 'member'
             BEGIN SELECT RAISE(ABORT, 'reparent refused'); END;",
        )?;
        identify(&mut store, Some("c@x.com"), Some("200"), 2)?;
        let before = store.list_contacts()?;

        let result = identify(&mut store, Some("a@x.com"), Some("200"), 3);
        let Err(err) = result else {
            return Err(anyhow!("merge should fail while re-parenting is refused"));
        };
        assert!(matches!(err.downcast_ref::<KernelError>(), Some(KernelError::Storage(_))));
        assert_eq!(store.list_contacts()?, before);
        Ok(())
    }

    // Test IDs: TREC-005
    #[test]
    fn blank_request_is_a_validation_error() -> Result<()> {
        let mut store = memory_store()?;
        let Err(err) = identify(&mut store, Some(""), None, 0) else {
            return Err(anyhow!("blank request should be rejected"));
        };
        assert!(matches!(err.downcast_ref::<KernelError>(), Some(KernelError::Validation(_))));
        assert!(store.list_contacts()?.is_empty());
        Ok(())
    }

    // Test IDs: TREC-006
    #[test]
    fn soft_deleted_rows_are_ignored_by_matching() -> Result<()> {
        let mut store = memory_store()?;
        identify(&mut store, Some("a@x.com"), Some("100"), 0)?;
        store.conn.execute(
            "UPDATE contacts SET deleted_at = ?1 WHERE id = 1",
            params![timestamp(at(1))?],
        )?;

        let fresh = identify(&mut store, Some("a@x.com"), None, 2)?;
        assert_eq!(fresh.contact.primary_id, ContactId(2));
        assert_eq!(store.group_for_contact(ContactId(1))?, None);
        Ok(())
    }

    // Test IDs: TREC-007
    #[test]
    fn group_for_member_returns_the_whole_group() -> Result<()> {
        let mut store = memory_store()?;
        identify(&mut store, Some("a@x.com"), Some("100"), 0)?;
        let second = identify(&mut store, Some("b@x.com"), Some("100"), 1)?;

        assert_eq!(store.group_for_contact(ContactId(2))?, Some(second.contact.clone()));
        assert_eq!(store.group_for_contact(ContactId(1))?, Some(second.contact));
        assert_eq!(store.group_for_contact(ContactId(42))?, None);
        Ok(())
    }

    // Test IDs: TINT-001
    #[test]
    fn integrity_check_reports_invariant_violations() -> Result<()> {
        let mut store = memory_store()?;
        identify(&mut store, Some("a@x.com"), Some("100"), 0)?;
        identify(&mut store, Some("b@x.com"), Some("200"), 1)?;
        assert!(store.integrity_check()?.is_healthy());

        store.conn.execute("UPDATE contacts SET email = 'a@x.com' WHERE id = 2", [])?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(
            report.invariant_violations.iter().map(|violation| violation.kind).collect::<Vec<_>>(),
            vec![ViolationKind::SharedIdentifierAcrossGroups]
        );
        assert!(!report.is_healthy());
        Ok(())
    }

    // Test IDs: TINT-002
    #[test]
    fn degenerate_matches_surface_an_anomaly_without_writes() -> Result<()> {
        let mut store = memory_store()?;
        identify(&mut store, Some("a@x.com"), Some("100"), 0)?;
        identify(&mut store, Some("b@x.com"), Some("100"), 1)?;
        store.conn.execute(
            "UPDATE contacts SET deleted_at = ?1 WHERE id = 1",
            params![timestamp(at(2))?],
        )?;

        let outcome = identify(&mut store, Some("b@x.com"), None, 3)?;
        assert_eq!(outcome.contact.primary_id, ContactId(2));
        assert_eq!(outcome.created_contact_id, None);
        assert!(outcome.anomalies.iter().any(|anomaly| anomaly.kind == AnomalyKind::RootNotFound));
        assert!(outcome
            .anomalies
            .iter()
            .any(|anomaly| anomaly.kind == AnomalyKind::MatchesWithoutRoot));
        assert_eq!(store.list_contacts()?.len(), 2);
        Ok(())
    }

    fn seed_legacy_contacts(store: &SqliteStore, inserts: &str) -> Result<()> {
        store.conn.execute_batch(
            "CREATE TABLE Contact (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               phoneNumber TEXT,
               email TEXT,
               linkedId INTEGER,
               linkPrecedence TEXT CHECK(linkPrecedence IN ('primary', 'secondary')) NOT NULL,
               createdAt DATETIME DEFAULT CURRENT_TIMESTAMP,
               updatedAt DATETIME DEFAULT CURRENT_TIMESTAMP,
               deletedAt DATETIME,
               FOREIGN KEY (linkedId) REFERENCES Contact(id)
             );",
        )?;
        store.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        store.conn.execute_batch(inserts)?;
        store.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    // Test IDs: TMIG-001
    #[test]
    fn legacy_contact_table_is_imported_on_migrate() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        seed_legacy_contacts(
            &store,
            "INSERT INTO Contact(phoneNumber, email, linkedId, linkPrecedence, createdAt, updatedAt)
               VALUES ('100', 'a@x.com', NULL, 'primary', '2023-04-01 00:00:00', '2023-04-01 00:00:00');
             INSERT INTO Contact(phoneNumber, email, linkedId, linkPrecedence, createdAt, updatedAt)
               VALUES ('100', 'b@x.com', 1, 'secondary', '2023-04-20T05:30:00.000Z', '2023-04-20T05:30:00.000Z');
             INSERT INTO Contact(phoneNumber, email, linkedId, linkPrecedence, createdAt, updatedAt)
               VALUES ('300', 'lost@x.com', NULL, 'secondary', '2023-05-01 00:00:00', '2023-05-01 00:00:00');",
        )?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 0);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        let records = store.list_contacts()?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].parent_id, Some(ContactId(1)));
        assert_eq!(records[1].role, ContactRole::Member);
        assert!(records[2].is_root());

        let lookup = identify(&mut store, None, Some("100"), 0)?;
        assert_eq!(lookup.contact.emails, vec!["a@x.com", "b@x.com"]);
        assert_eq!(lookup.contact.member_ids, ids(&[2]));
        Ok(())
    }

    // Test IDs: TMIG-002
    #[test]
    fn legacy_chains_are_flattened_onto_their_top_root() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        seed_legacy_contacts(
            &store,
            "INSERT INTO Contact(id, phoneNumber, email, linkedId, linkPrecedence, createdAt)
               VALUES (1, '100', 'a@x.com', NULL, 'primary', '2023-04-01 00:00:00');
             INSERT INTO Contact(id, phoneNumber, email, linkedId, linkPrecedence, createdAt)
               VALUES (2, '200', 'b@x.com', 1, 'secondary', '2023-04-02 00:00:00');
             INSERT INTO Contact(id, phoneNumber, email, linkedId, linkPrecedence, createdAt)
               VALUES (3, '300', 'c@x.com', 2, 'secondary', '2023-04-03 00:00:00');
             INSERT INTO Contact(id, phoneNumber, email, linkedId, linkPrecedence, createdAt)
               VALUES (4, '400', 'd@x.com', 5, 'secondary', '2023-04-04 00:00:00');
             INSERT INTO Contact(id, phoneNumber, email, linkedId, linkPrecedence, createdAt)
               VALUES (5, '500', 'e@x.com', 4, 'secondary', '2023-04-05 00:00:00');",
        )?;

        store.migrate()?;
        let records = store.list_contacts()?;
        let parents = records.iter().map(|record| record.parent_id).collect::<Vec<_>>();
        assert_eq!(
            parents,
            vec![None, Some(ContactId(1)), Some(ContactId(1)), None, Some(ContactId(4))]
        );
        assert!(store.integrity_check()?.is_healthy());

        let lookup = identify(&mut store, Some("a@x.com"), None, 0)?;
        assert_eq!(lookup.contact.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(lookup.contact.phones, vec!["100", "200", "300"]);
        assert_eq!(lookup.contact.member_ids, ids(&[2, 3]));
        assert_eq!(lookup.created_contact_id, None);
        Ok(())
    }

    // Test IDs: TMIG-003
    #[test]
    fn legacy_links_to_absent_rows_are_promoted_to_roots() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        seed_legacy_contacts(
            &store,
            "INSERT INTO Contact(id, phoneNumber, email, linkedId, linkPrecedence, createdAt)
               VALUES (1, '100', 'a@x.com', NULL, 'primary', '2023-04-01 00:00:00');
             INSERT INTO Contact(id, phoneNumber, email, linkedId, linkPrecedence, createdAt)
               VALUES (2, '200', 'b@x.com', 99, 'secondary', '2023-04-02 00:00:00');
             INSERT INTO Contact(id, phoneNumber, email, linkedId, linkPrecedence, createdAt)
               VALUES (3, '300', 'c@x.com', 2, 'secondary', '2023-04-03 00:00:00');",
        )?;

        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, 1);
        let records = store.list_contacts()?;
        assert!(records[1].is_root());
        assert_eq!(records[2].parent_id, Some(ContactId(2)));
        assert!(store.integrity_check()?.is_healthy());

        let lookup = identify(&mut store, None, Some("300"), 0)?;
        assert_eq!(lookup.contact.primary_id, ContactId(2));
        assert_eq!(lookup.contact.emails, vec!["b@x.com", "c@x.com"]);
        Ok(())
    }

    // Test IDs: TMIG-004
    #[test]
    fn legacy_import_summary_counts_flattened_and_promoted_rows() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        seed_legacy_contacts(
            &store,
            "INSERT INTO Contact(id, email, linkedId, linkPrecedence) VALUES (1, 'a@x.com', NULL, 'primary');
             INSERT INTO Contact(id, email, linkedId, linkPrecedence) VALUES (2, 'b@x.com', 1, 'secondary');
             INSERT INTO Contact(id, email, linkedId, linkPrecedence) VALUES (3, 'c@x.com', 2, 'secondary');
             INSERT INTO Contact(id, email, linkedId, linkPrecedence) VALUES (4, 'd@x.com', 42, 'secondary');",
        )?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let summary = import_legacy_contacts(&store.conn)?;
        assert_eq!(
            summary,
            LegacyImportSummary { imported_contacts: 4, promoted_orphans: 1, flattened_members: 1 }
        );
        Ok(())
    }

    // Test IDs: TBAK-001
    #[test]
    fn backup_and_restore_round_trip_contacts() -> Result<()> {
        let source_path = temp_db_path("backup-source");
        let backup_path = temp_db_path("backup-copy");
        {
            let mut store = SqliteStore::open(&source_path)?;
            store.migrate()?;
            identify(&mut store, Some("a@x.com"), Some("100"), 0)?;
            store.backup_database(&backup_path)?;
        }

        let mut restored = memory_store()?;
        restored.restore_database(&backup_path)?;
        assert_eq!(restored.list_contacts()?.len(), 1);
        assert!(restored.integrity_check()?.is_healthy());

        let missing = restored.restore_database(&temp_db_path("missing"));
        assert!(missing.is_err());

        cleanup(&source_path)?;
        cleanup(&backup_path)?;
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_first_sightings_create_a_single_root() -> Result<()> {
        let db_path = temp_db_path("concurrency");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }

        let writer_threads = 8;
        let mut handles = Vec::new();
        for _ in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<ContactId> {
                let mut store = SqliteStore::open(&writer_path)?;
                let outcome = store.reconcile(
                    &IdentifyRequest::new(Some("race@x.com"), Some("555")),
                    OffsetDateTime::now_utc(),
                )?;
                Ok(outcome.contact.primary_id)
            }));
        }

        let mut primaries = Vec::new();
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            primaries.push(thread_result?);
        }
        primaries.dedup();
        assert_eq!(primaries, ids(&[1]));

        let store = SqliteStore::open(&db_path)?;
        assert_eq!(store.list_contacts()?.len(), 1);
        assert!(store.integrity_check()?.is_healthy());
        drop(store);

        cleanup(&db_path)?;
        Ok(())
    }

    // Test IDs: TCONC-002
    #[test]
    fn held_write_lock_surfaces_as_retryable_conflict() -> Result<()> {
        let db_path = temp_db_path("conflict");
        let mut holder = SqliteStore::open(&db_path)?;
        holder.migrate()?;
        let mut contender =
            SqliteStore::open_with_busy_timeout(&db_path, Duration::from_millis(50))?;

        let lock = holder.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Err(err) = identify(&mut contender, Some("a@x.com"), None, 0) else {
            return Err(anyhow!("reconcile should fail while the write lock is held"));
        };
        assert!(err.downcast_ref::<KernelError>().is_some_and(KernelError::is_retryable));
        lock.rollback()?;

        identify(&mut contender, Some("a@x.com"), None, 1)?;
        drop(contender);
        drop(holder);
        cleanup(&db_path)?;
        Ok(())
    }
}
