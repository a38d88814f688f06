use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod arena;

pub use arena::{ContactArena, SharedContactArena};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization conflict: {0}")]
    Conflict(String),
    #[error("integrity error: {0}")]
    Integrity(String),
}

impl KernelError {
    /// Only serialization conflicts are safe to replay from the top of a reconciliation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContactRole {
    Root,
    Member,
}

impl ContactRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Member => "member",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "root" => Some(Self::Root),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub parent_id: Option<ContactId>,
    pub role: ContactRole,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl ContactRecord {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.role == ContactRole::Root && self.parent_id.is_none()
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The root this record contributes to a match: its own id for a root,
    /// its parent for a member, nothing for a member that lost its parent.
    #[must_use]
    pub fn effective_root_id(&self) -> Option<ContactId> {
        match self.role {
            ContactRole::Root => Some(self.id),
            ContactRole::Member => self.parent_id,
        }
    }

    #[must_use]
    pub fn holds_pair(&self, email: &str, phone: &str) -> bool {
        self.email.as_deref() == Some(email) && self.phone.as_deref() == Some(phone)
    }

    /// Validate the role/parent pairing of a single record.
    ///
    /// # Errors
    /// Returns [`KernelError::Integrity`] when `role` and `parent_id` disagree,
    /// a record is its own parent, or neither identifier is present.
    pub fn validate(&self) -> Result<(), KernelError> {
        match (self.role, self.parent_id) {
            (ContactRole::Root, Some(parent)) => {
                return Err(KernelError::Integrity(format!(
                    "contact {} is a root but points at parent {parent}",
                    self.id
                )));
            }
            (ContactRole::Member, None) => {
                return Err(KernelError::Integrity(format!(
                    "contact {} is a member without a parent",
                    self.id
                )));
            }
            (ContactRole::Member, Some(parent)) if parent == self.id => {
                return Err(KernelError::Integrity(format!(
                    "contact {} is its own parent",
                    self.id
                )));
            }
            _ => {}
        }

        if self.email.is_none() && self.phone.is_none() {
            return Err(KernelError::Integrity(format!(
                "contact {} holds neither an email nor a phone",
                self.id
            )));
        }

        Ok(())
    }
}

/// Canonical record order: `created_at` ascending, then `id`.
fn creation_order(lhs: &ContactRecord, rhs: &ContactRecord) -> Ordering {
    lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub parent_id: Option<ContactId>,
}

impl NewContact {
    #[must_use]
    pub fn root(email: Option<String>, phone: Option<String>) -> Self {
        Self { email, phone, parent_id: None }
    }

    #[must_use]
    pub fn member(email: Option<String>, phone: Option<String>, parent_id: ContactId) -> Self {
        Self { email, phone, parent_id: Some(parent_id) }
    }

    #[must_use]
    pub fn role(&self) -> ContactRole {
        if self.parent_id.is_some() {
            ContactRole::Member
        } else {
            ContactRole::Root
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "phoneNumber", alias = "phone")]
    pub phone: Option<String>,
}

impl IdentifyRequest {
    #[must_use]
    pub fn new(email: Option<&str>, phone: Option<&str>) -> Self {
        Self { email: email.map(str::to_string), phone: phone.map(str::to_string) }
    }

    /// Blank identifiers are treated as absent; values are otherwise compared verbatim.
    #[must_use]
    pub fn normalized(&self) -> Self {
        fn present(value: Option<&String>) -> Option<String> {
            value.filter(|value| !value.trim().is_empty()).cloned()
        }

        Self { email: present(self.email.as_ref()), phone: present(self.phone.as_ref()) }
    }

    #[must_use]
    pub fn has_identifier(&self) -> bool {
        self.email.is_some() || self.phone.is_some()
    }

    #[must_use]
    pub fn pair(&self) -> Option<(&str, &str)> {
        Some((self.email.as_deref()?, self.phone.as_deref()?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    pub primary_id: ContactId,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub member_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    MatchesWithoutRoot,
    RootNotFound,
    ParentNotRoot,
    ParentCycle,
}

impl AnomalyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MatchesWithoutRoot => "matches_without_root",
            Self::RootNotFound => "root_not_found",
            Self::ParentNotRoot => "parent_not_root",
            Self::ParentCycle => "parent_cycle",
        }
    }
}

/// A data-integrity signal raised while resolving a request that still completed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntegrityAnomaly {
    pub kind: AnomalyKind,
    pub contact_ids: Vec<ContactId>,
    pub detail: String,
}

/// Storage collaborator for one unit of work.
///
/// Every method runs inside whatever transaction the implementor was opened
/// with; `reconcile` never commits or rolls back on its own. Lookups exclude
/// soft-deleted rows and return records in creation order.
pub trait ContactLedger {
    /// # Errors
    /// Returns a storage or conflict error from the backing store.
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<ContactRecord>, KernelError>;

    /// Root `root_id` plus every record whose `parent_id` is `root_id`.
    ///
    /// # Errors
    /// Returns a storage or conflict error from the backing store.
    fn find_group(&self, root_id: ContactId) -> Result<Vec<ContactRecord>, KernelError>;

    /// # Errors
    /// Returns a storage or conflict error from the backing store.
    fn get(&self, id: ContactId) -> Result<Option<ContactRecord>, KernelError>;

    /// # Errors
    /// Returns a storage or conflict error from the backing store.
    fn insert(
        &mut self,
        contact: NewContact,
        now: OffsetDateTime,
    ) -> Result<ContactRecord, KernelError>;

    /// Flip one record to `member` under `parent_id`.
    ///
    /// # Errors
    /// Returns a storage or conflict error, or [`KernelError::Integrity`] when the
    /// record is absent.
    fn demote(
        &mut self,
        id: ContactId,
        parent_id: ContactId,
        now: OffsetDateTime,
    ) -> Result<(), KernelError>;

    /// Point every live member of `from` at `to`; returns how many rows moved.
    ///
    /// # Errors
    /// Returns a storage or conflict error from the backing store.
    fn reparent_members(
        &mut self,
        from: ContactId,
        to: ContactId,
        now: OffsetDateTime,
    ) -> Result<usize, KernelError>;
}

/// Fetch every live record sharing the email or the phone, oldest first.
///
/// # Errors
/// Propagates ledger failures unchanged.
pub fn match_contacts<L: ContactLedger + ?Sized>(
    ledger: &L,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<Vec<ContactRecord>, KernelError> {
    if email.is_none() && phone.is_none() {
        return Ok(Vec::new());
    }

    let mut matches = ledger
        .find_by_identifiers(email, phone)?
        .into_iter()
        .filter(|record| !record.is_deleted())
        .filter(|record| {
            (email.is_some() && record.email.as_deref() == email)
                || (phone.is_some() && record.phone.as_deref() == phone)
        })
        .collect::<Vec<_>>();
    matches.sort_by(creation_order);
    Ok(matches)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Decision {
    CreateRoot,
    Existing { survivor: ContactRecord, losers: Vec<ContactRecord>, append_member: bool },
    AdHocRoot { root: ContactRecord },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Resolution {
    pub decision: Decision,
    pub anomalies: Vec<IntegrityAnomaly>,
}

#[must_use]
pub fn implicated_root_ids(matches: &[ContactRecord]) -> BTreeSet<ContactId> {
    matches.iter().filter_map(ContactRecord::effective_root_id).collect()
}

/// A member is appended only when both identifiers were supplied and no match
/// already holds that exact pair.
#[must_use]
pub fn needs_new_member(request: &IdentifyRequest, matches: &[ContactRecord]) -> bool {
    let Some((email, phone)) = request.pair() else {
        return false;
    };
    !matches.iter().any(|record| record.holds_pair(email, phone))
}

fn load_root<L: ContactLedger + ?Sized>(
    ledger: &L,
    start: ContactId,
    anomalies: &mut Vec<IntegrityAnomaly>,
) -> Result<Option<ContactRecord>, KernelError> {
    let mut visited = BTreeSet::new();
    let mut current = start;

    loop {
        if !visited.insert(current) {
            anomalies.push(IntegrityAnomaly {
                kind: AnomalyKind::ParentCycle,
                contact_ids: visited.into_iter().collect(),
                detail: format!("parent chain starting at {start} loops back to {current}"),
            });
            return Ok(None);
        }

        let record = match ledger.get(current)? {
            Some(record) if !record.is_deleted() => record,
            _ => {
                anomalies.push(IntegrityAnomaly {
                    kind: AnomalyKind::RootNotFound,
                    contact_ids: vec![current],
                    detail: format!("implicated root {current} is missing or deleted"),
                });
                return Ok(None);
            }
        };

        if record.is_root() {
            return Ok(Some(record));
        }

        let Some(parent) = record.parent_id else {
            anomalies.push(IntegrityAnomaly {
                kind: AnomalyKind::RootNotFound,
                contact_ids: vec![current],
                detail: format!("implicated root {current} is a member without a parent"),
            });
            return Ok(None);
        };

        anomalies.push(IntegrityAnomaly {
            kind: AnomalyKind::ParentNotRoot,
            contact_ids: vec![current, parent],
            detail: format!("implicated root {current} is a member of {parent}"),
        });
        current = parent;
    }
}

/// Decide what the request implies for the identity graph, without writing.
///
/// # Errors
/// Propagates ledger failures raised while loading implicated roots.
pub fn resolve<L: ContactLedger + ?Sized>(
    ledger: &L,
    request: &IdentifyRequest,
    matches: &[ContactRecord],
) -> Result<Resolution, KernelError> {
    let mut anomalies = Vec::new();

    if matches.is_empty() {
        return Ok(Resolution { decision: Decision::CreateRoot, anomalies });
    }

    let mut roots: BTreeMap<ContactId, ContactRecord> = BTreeMap::new();
    for root_id in implicated_root_ids(matches) {
        if let Some(root) = load_root(ledger, root_id, &mut anomalies)? {
            roots.insert(root.id, root);
        }
    }

    let mut roots = roots.into_values().collect::<Vec<_>>();
    roots.sort_by(creation_order);
    let mut roots = roots.into_iter();

    let Some(survivor) = roots.next() else {
        let mut ordered = matches.to_vec();
        ordered.sort_by(creation_order);
        let root = ordered.swap_remove(0);
        anomalies.push(IntegrityAnomaly {
            kind: AnomalyKind::MatchesWithoutRoot,
            contact_ids: matches.iter().map(|record| record.id).collect(),
            detail: format!(
                "{} matched records yield no root; treating {} as an ad-hoc root",
                matches.len(),
                root.id
            ),
        });
        return Ok(Resolution { decision: Decision::AdHocRoot { root }, anomalies });
    };

    Ok(Resolution {
        decision: Decision::Existing {
            survivor,
            losers: roots.collect(),
            append_member: needs_new_member(request, matches),
        },
        anomalies,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeReport {
    pub survivor_id: Option<ContactId>,
    pub demoted_ids: Vec<ContactId>,
    pub reparented: usize,
}

/// Demote each loser under the survivor and cascade its members.
///
/// This is the only place a `parent_id` is rewritten, so it re-checks that the
/// survivor and every loser are live roots before touching them. Losers that
/// already hang off the survivor are skipped.
///
/// # Errors
/// Returns [`KernelError::Integrity`] when the survivor or a loser is not a live
/// root, or propagates ledger failures. Callers must roll back on error.
pub fn execute_merge<L: ContactLedger + ?Sized>(
    ledger: &mut L,
    survivor_id: ContactId,
    loser_ids: &[ContactId],
    now: OffsetDateTime,
) -> Result<MergeReport, KernelError> {
    let survivor = ledger
        .get(survivor_id)?
        .filter(|record| !record.is_deleted())
        .ok_or_else(|| KernelError::Integrity(format!("merge survivor {survivor_id} not found")))?;
    if !survivor.is_root() {
        return Err(KernelError::Integrity(format!(
            "merge survivor {survivor_id} is not a root"
        )));
    }

    let mut report = MergeReport { survivor_id: Some(survivor_id), ..MergeReport::default() };
    for &loser_id in loser_ids {
        if loser_id == survivor_id {
            return Err(KernelError::Integrity(format!(
                "contact {loser_id} cannot be merged into itself"
            )));
        }

        let loser = ledger
            .get(loser_id)?
            .filter(|record| !record.is_deleted())
            .ok_or_else(|| KernelError::Integrity(format!("merge loser {loser_id} not found")))?;
        if loser.parent_id == Some(survivor_id) {
            continue;
        }
        if !loser.is_root() {
            return Err(KernelError::Integrity(format!("merge loser {loser_id} is not a root")));
        }

        ledger.demote(loser_id, survivor_id, now)?;
        report.reparented += ledger.reparent_members(loser_id, survivor_id, now)?;
        report.demoted_ids.push(loser_id);
    }

    Ok(report)
}

/// Build the response view for one group. `group` must contain the root.
///
/// # Errors
/// Returns [`KernelError::Integrity`] when the root is absent from `group`.
pub fn consolidate(
    root_id: ContactId,
    group: &[ContactRecord],
) -> Result<ConsolidatedContact, KernelError> {
    let root = group
        .iter()
        .find(|record| record.id == root_id)
        .ok_or_else(|| KernelError::Integrity(format!("group for {root_id} is missing its root")))?;

    let mut members = group
        .iter()
        .filter(|record| record.id != root_id && !record.is_deleted())
        .collect::<Vec<_>>();
    members.sort_by(|lhs, rhs| creation_order(lhs, rhs));

    let mut emails = OrderedSet::default();
    let mut phones = OrderedSet::default();
    for record in std::iter::once(root).chain(members.iter().copied()) {
        if let Some(email) = &record.email {
            emails.push(email);
        }
        if let Some(phone) = &record.phone {
            phones.push(phone);
        }
    }

    Ok(ConsolidatedContact {
        primary_id: root.id,
        emails: emails.into_vec(),
        phones: phones.into_vec(),
        member_ids: members.iter().map(|record| record.id).collect(),
    })
}

#[derive(Default)]
struct OrderedSet<'a> {
    seen: HashSet<&'a str>,
    values: Vec<&'a str>,
}

impl<'a> OrderedSet<'a> {
    fn push(&mut self, value: &'a str) {
        if self.seen.insert(value) {
            self.values.push(value);
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.values.into_iter().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reconciliation {
    pub contact: ConsolidatedContact,
    pub created_contact_id: Option<ContactId>,
    pub merge: Option<MergeReport>,
    #[serde(default)]
    pub anomalies: Vec<IntegrityAnomaly>,
}

/// Run one reconciliation against an open unit of work.
///
/// Matcher, resolver, merge executor and consolidator run in order against the
/// same ledger handle. The caller owns the transaction: commit on `Ok`, roll
/// back on `Err`.
///
/// # Errors
/// Returns [`KernelError::Validation`] when neither identifier is present,
/// [`KernelError::Integrity`] when the merge executor refuses corrupt data,
/// or any ledger failure unchanged.
pub fn reconcile<L: ContactLedger + ?Sized>(
    ledger: &mut L,
    request: &IdentifyRequest,
    now: OffsetDateTime,
) -> Result<Reconciliation, KernelError> {
    let request = request.normalized();
    if !request.has_identifier() {
        return Err(KernelError::Validation(
            "at least one of email or phoneNumber must be provided".to_string(),
        ));
    }

    let matches = match_contacts(ledger, request.email.as_deref(), request.phone.as_deref())?;
    tracing::debug!(matches = matches.len(), "matched existing contacts");

    let Resolution { decision, anomalies } = resolve(ledger, &request, &matches)?;
    for anomaly in &anomalies {
        tracing::error!(
            kind = anomaly.kind.as_str(),
            contact_ids = ?anomaly.contact_ids,
            detail = %anomaly.detail,
            "identity graph integrity anomaly"
        );
    }

    let mut created_contact_id = None;
    let mut merge = None;
    let root_id = match decision {
        Decision::CreateRoot => {
            let created =
                ledger.insert(NewContact::root(request.email.clone(), request.phone.clone()), now)?;
            tracing::info!(contact_id = %created.id, "created root contact");
            created_contact_id = Some(created.id);
            created.id
        }
        Decision::Existing { survivor, losers, append_member } => {
            if !losers.is_empty() {
                let loser_ids = losers.iter().map(|record| record.id).collect::<Vec<_>>();
                let report = execute_merge(ledger, survivor.id, &loser_ids, now)?;
                tracing::info!(
                    survivor_id = %survivor.id,
                    demoted_ids = ?report.demoted_ids,
                    reparented = report.reparented,
                    "merged identity groups"
                );
                merge = Some(report);
            }
            if append_member {
                let created = ledger.insert(
                    NewContact::member(request.email.clone(), request.phone.clone(), survivor.id),
                    now,
                )?;
                tracing::info!(
                    contact_id = %created.id,
                    root_id = %survivor.id,
                    "created member contact"
                );
                created_contact_id = Some(created.id);
            }
            survivor.id
        }
        Decision::AdHocRoot { root } => root.id,
    };

    let mut group = ledger.find_group(root_id)?;
    if !group.iter().any(|record| record.id == root_id) {
        // An ad-hoc root may not satisfy the ledger's group query; pin it in.
        if let Some(root) = ledger.get(root_id)? {
            group.push(root);
        }
    }
    let contact = consolidate(root_id, &group)?;

    Ok(Reconciliation { contact, created_contact_id, merge, anomalies })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    RoleParentMismatch,
    MissingIdentifiers,
    ParentMissing,
    ParentNotRoot,
    SharedIdentifierAcrossGroups,
    DuplicatePairInGroup,
}

impl ViolationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoleParentMismatch => "role_parent_mismatch",
            Self::MissingIdentifiers => "missing_identifiers",
            Self::ParentMissing => "parent_missing",
            Self::ParentNotRoot => "parent_not_root",
            Self::SharedIdentifierAcrossGroups => "shared_identifier_across_groups",
            Self::DuplicatePairInGroup => "duplicate_pair_in_group",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InvariantViolation {
    pub kind: ViolationKind,
    pub contact_ids: Vec<ContactId>,
    pub detail: String,
}

/// Check the stored identity graph against its structural invariants.
///
/// Soft-deleted records are ignored. Violations come back in a stable order:
/// per-record checks by id, then cross-record checks by identifier value.
#[must_use]
pub fn audit_invariants(records: &[ContactRecord]) -> Vec<InvariantViolation> {
    let live = records
        .iter()
        .filter(|record| !record.is_deleted())
        .map(|record| (record.id, record))
        .collect::<BTreeMap<_, _>>();
    let mut violations = Vec::new();

    for record in live.values() {
        if record.email.is_none() && record.phone.is_none() {
            violations.push(InvariantViolation {
                kind: ViolationKind::MissingIdentifiers,
                contact_ids: vec![record.id],
                detail: format!("contact {} holds neither an email nor a phone", record.id),
            });
        }

        match (record.role, record.parent_id) {
            (ContactRole::Root, None) => {}
            (ContactRole::Root, Some(_)) | (ContactRole::Member, None) => {
                violations.push(InvariantViolation {
                    kind: ViolationKind::RoleParentMismatch,
                    contact_ids: vec![record.id],
                    detail: format!(
                        "contact {} has role={} with parent_id={:?}",
                        record.id,
                        record.role.as_str(),
                        record.parent_id.map(|id| id.0)
                    ),
                });
            }
            (ContactRole::Member, Some(parent_id)) => match live.get(&parent_id) {
                None => violations.push(InvariantViolation {
                    kind: ViolationKind::ParentMissing,
                    contact_ids: vec![record.id, parent_id],
                    detail: format!(
                        "contact {} points at missing or deleted parent {parent_id}",
                        record.id
                    ),
                }),
                Some(parent) if !parent.is_root() => violations.push(InvariantViolation {
                    kind: ViolationKind::ParentNotRoot,
                    contact_ids: vec![record.id, parent_id],
                    detail: format!("contact {} points at non-root parent {parent_id}", record.id),
                }),
                Some(_) => {}
            },
        }
    }

    let mut roots_by_email: BTreeMap<&str, BTreeSet<ContactId>> = BTreeMap::new();
    let mut roots_by_phone: BTreeMap<&str, BTreeSet<ContactId>> = BTreeMap::new();
    let mut pairs: BTreeMap<(ContactId, &str, &str), Vec<ContactId>> = BTreeMap::new();
    for record in live.values() {
        let Some(root_id) = record.effective_root_id() else {
            continue;
        };
        if let Some(email) = record.email.as_deref() {
            roots_by_email.entry(email).or_default().insert(root_id);
        }
        if let Some(phone) = record.phone.as_deref() {
            roots_by_phone.entry(phone).or_default().insert(root_id);
        }
        if let (Some(email), Some(phone)) = (record.email.as_deref(), record.phone.as_deref()) {
            pairs.entry((root_id, email, phone)).or_default().push(record.id);
        }
    }

    for (label, index) in [("email", &roots_by_email), ("phone", &roots_by_phone)] {
        for (value, roots) in index {
            if roots.len() > 1 {
                violations.push(InvariantViolation {
                    kind: ViolationKind::SharedIdentifierAcrossGroups,
                    contact_ids: roots.iter().copied().collect(),
                    detail: format!("{label} {value} is shared by {} groups", roots.len()),
                });
            }
        }
    }

    for ((root_id, email, phone), ids) in pairs {
        if ids.len() > 1 {
            violations.push(InvariantViolation {
                kind: ViolationKind::DuplicatePairInGroup,
                contact_ids: ids,
                detail: format!(
                    "pair ({email}, {phone}) is recorded more than once under {root_id}"
                ),
            });
        }
    }

    violations
}
