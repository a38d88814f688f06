use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use time::OffsetDateTime;

use crate::{
    reconcile, ContactId, ContactLedger, ContactRecord, IdentifyRequest, KernelError, NewContact,
    Reconciliation,
};

/// In-memory contact store keyed by id.
///
/// Each `reconcile` call snapshots the arena first and restores it on error, so a
/// failed request leaves no partial merge behind.
#[derive(Debug, Clone, Default)]
pub struct ContactArena {
    records: BTreeMap<ContactId, ContactRecord>,
    next_id: i64,
    #[cfg(test)]
    fail_next_reparent: bool,
}

impl ContactArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, including soft-deleted ones, ordered by id.
    #[must_use]
    pub fn records(&self) -> Vec<ContactRecord> {
        self.records.values().cloned().collect()
    }

    /// Seed a record verbatim, bypassing every check. Intended for fixtures and imports.
    pub fn insert_raw(&mut self, record: ContactRecord) {
        self.next_id = self.next_id.max(record.id.0);
        self.records.insert(record.id, record);
    }

    /// # Errors
    /// Returns the reconciliation error after restoring the pre-call state.
    pub fn reconcile(
        &mut self,
        request: &IdentifyRequest,
        now: OffsetDateTime,
    ) -> Result<Reconciliation, KernelError> {
        let snapshot = (self.records.clone(), self.next_id);
        let outcome = reconcile(self, request, now);
        if outcome.is_err() {
            (self.records, self.next_id) = snapshot;
        }
        outcome
    }

    #[cfg(test)]
    pub(crate) fn fail_next_reparent(&mut self) {
        self.fail_next_reparent = true;
    }

    fn live(&self) -> impl Iterator<Item = &ContactRecord> {
        self.records.values().filter(|record| !record.is_deleted())
    }

    fn by_creation(mut records: Vec<ContactRecord>) -> Vec<ContactRecord> {
        records.sort_by(|lhs, rhs| {
            lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
        });
        records
    }
}

impl ContactLedger for ContactArena {
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<ContactRecord>, KernelError> {
        let matches = self
            .live()
            .filter(|record| {
                (email.is_some() && record.email.as_deref() == email)
                    || (phone.is_some() && record.phone.as_deref() == phone)
            })
            .cloned()
            .collect();
        Ok(Self::by_creation(matches))
    }

    fn find_group(&self, root_id: ContactId) -> Result<Vec<ContactRecord>, KernelError> {
        let group = self
            .live()
            .filter(|record| record.id == root_id || record.parent_id == Some(root_id))
            .cloned()
            .collect();
        Ok(Self::by_creation(group))
    }

    fn get(&self, id: ContactId) -> Result<Option<ContactRecord>, KernelError> {
        Ok(self.records.get(&id).cloned())
    }

    fn insert(
        &mut self,
        contact: NewContact,
        now: OffsetDateTime,
    ) -> Result<ContactRecord, KernelError> {
        self.next_id += 1;
        let record = ContactRecord {
            id: ContactId(self.next_id),
            role: contact.role(),
            email: contact.email,
            phone: contact.phone,
            parent_id: contact.parent_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        record.validate()?;
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn demote(
        &mut self,
        id: ContactId,
        parent_id: ContactId,
        now: OffsetDateTime,
    ) -> Result<(), KernelError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| KernelError::Integrity(format!("contact {id} not found")))?;
        record.role = crate::ContactRole::Member;
        record.parent_id = Some(parent_id);
        record.updated_at = now;
        Ok(())
    }

    fn reparent_members(
        &mut self,
        from: ContactId,
        to: ContactId,
        now: OffsetDateTime,
    ) -> Result<usize, KernelError> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_reparent) {
            return Err(KernelError::Storage("injected reparent failure".to_string()));
        }

        let mut moved = 0;
        for record in self.records.values_mut() {
            if record.parent_id == Some(from) && !record.is_deleted() {
                record.parent_id = Some(to);
                record.updated_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

/// Arena behind a mutex; concurrent callers are serialized per reconciliation.
#[derive(Debug, Default)]
pub struct SharedContactArena {
    inner: Mutex<ContactArena>,
}

impl SharedContactArena {
    #[must_use]
    pub fn new(arena: ContactArena) -> Self {
        Self { inner: Mutex::new(arena) }
    }

    /// # Errors
    /// Returns the reconciliation error; the arena is left as it was before the call.
    pub fn reconcile(
        &self,
        request: &IdentifyRequest,
        now: OffsetDateTime,
    ) -> Result<Reconciliation, KernelError> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).reconcile(request, now)
    }

    #[must_use]
    pub fn records(&self) -> Vec<ContactRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).records()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use time::Duration;

    use super::*;
    use crate::audit_invariants;

    #[test]
    fn concurrent_first_sightings_produce_one_root() {
        let shared = Arc::new(SharedContactArena::default());
        let now = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000);

        let handles = (0..8)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    shared.reconcile(&IdentifyRequest::new(Some("race@x.com"), Some("42")), now)
                })
            })
            .collect::<Vec<_>>();

        let mut primaries = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(Ok(outcome)) => primaries.push(outcome.contact.primary_id),
                Ok(Err(err)) => panic!("reconcile failed: {err}"),
                Err(_) => panic!("worker thread panicked"),
            }
        }

        primaries.dedup();
        assert_eq!(primaries, vec![ContactId(1)]);
        let records = shared.records();
        assert_eq!(records.len(), 1);
        assert!(audit_invariants(&records).is_empty());
    }

    #[test]
    fn soft_deleted_records_are_invisible_to_lookups() -> Result<(), KernelError> {
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut arena = ContactArena::new();
        let mut gone = arena.insert(NewContact::root(Some("gone@x.com".to_string()), None), now)?;
        gone.deleted_at = Some(now);
        arena.insert_raw(gone);

        let outcome = arena.reconcile(&IdentifyRequest::new(Some("gone@x.com"), None), now)?;
        assert_eq!(outcome.contact.primary_id, ContactId(2));
        assert_eq!(outcome.created_contact_id, Some(ContactId(2)));
        Ok(())
    }
}
