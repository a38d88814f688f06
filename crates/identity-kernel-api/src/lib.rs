use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use identity_kernel_core::{
    ContactId, ConsolidatedContact, ContactRecord, IdentifyRequest, KernelError, Reconciliation,
};
use identity_kernel_store_sqlite::{
    IntegrityReport, SchemaStatus, SqliteStore, DEFAULT_BUSY_TIMEOUT,
};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const EMAIL_PATTERN: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";
const PHONE_PATTERN: &str = r"^\d+$";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct IdentityKernelApi {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl IdentityKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_busy_timeout(&self.db_path, self.busy_timeout)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Validate one identify request and reconcile it against the store.
    ///
    /// # Errors
    /// Returns an error wrapping [`KernelError::Validation`] for malformed input,
    /// [`KernelError::Conflict`] when the write lock stayed busy, or any other
    /// store failure.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<Reconciliation> {
        let request = validate_identify_request(request)?;
        let mut store = self.open_store()?;
        store.migrate()?;
        store.reconcile(&request, OffsetDateTime::now_utc())
    }

    /// Consolidated view of the group containing `id`; `None` when no live record has that id.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn contact_show(&self, id: ContactId) -> Result<Option<ConsolidatedContact>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.group_for_contact(id)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn contact_list(&self) -> Result<Vec<ContactRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_contacts()
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }
}

/// Normalize a request and enforce the boundary rules: at least one identifier,
/// a plausible email shape, and a digits-only phone.
///
/// # Errors
/// Returns an error wrapping [`KernelError::Validation`] describing the first rule broken.
pub fn validate_identify_request(request: &IdentifyRequest) -> Result<IdentifyRequest> {
    let request = request.normalized();
    if !request.has_identifier() {
        return Err(KernelError::Validation(
            "at least one of email or phoneNumber must be provided".to_string(),
        )
        .into());
    }

    if let Some(email) = request.email.as_deref() {
        let email_re = Regex::new(EMAIL_PATTERN).context("invalid email pattern")?;
        if !email_re.is_match(email) {
            return Err(KernelError::Validation(format!("invalid email format: {email}")).into());
        }
    }

    if let Some(phone) = request.phone.as_deref() {
        let phone_re = Regex::new(PHONE_PATTERN).context("invalid phone pattern")?;
        if !phone_re.is_match(phone) {
            return Err(KernelError::Validation(format!(
                "invalid phoneNumber format: {phone} (digits only)"
            ))
            .into());
        }
    }

    Ok(request)
}

/// The [`KernelError`] behind an API error, if one is present in its chain.
#[must_use]
pub fn kernel_error(err: &anyhow::Error) -> Option<&KernelError> {
    err.chain().find_map(|cause| cause.downcast_ref::<KernelError>())
}

/// # Errors
/// Returns an error when `raw` is not a positive integer id.
pub fn parse_contact_id(raw: &str) -> Result<ContactId> {
    match raw.parse::<i64>() {
        Ok(value) if value > 0 => Ok(ContactId(value)),
        _ => Err(anyhow!(KernelError::Validation(format!("invalid contact id: {raw}")))),
    }
}
