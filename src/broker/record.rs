//! Registry records and the storage seam behind them.

use hashbrown::HashMap;
use parking_lot::RwLock;
use rkyv::{Archive, Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{
    error::BrokerError,
    hrn::{Hrn, RecordType},
};

/// Free-form testbed detail attached by a driver's augment hook.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct TestbedField {
    pub key: String,
    pub value: String,
}

/// An identity or ownership object, keyed by `(kind, hrn)` and owned by the
/// authority whose prefix matches its HRN.
#[derive(Archive, Serialize, Deserialize, TypedBuilder, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Record {
    pub hrn: Hrn,
    pub kind: RecordType,
    /// Testbed-native handle returned by the driver at registration.
    #[builder(default)]
    pub pointer: Option<String>,
    /// Identity material (certificate) for this object.
    #[builder(default)]
    pub gid: Option<String>,
    /// Encoded KT2 public key the object signs challenges with. Required
    /// to obtain a credential as the object itself.
    #[builder(default)]
    pub signing_key: Option<Vec<u8>>,
    /// Public keys. Changing them changes the identity of a user.
    #[builder(default)]
    pub keys: Vec<String>,
    /// Slice members.
    #[builder(default)]
    pub researchers: Vec<Hrn>,
    /// Principal investigators of an authority.
    #[builder(default)]
    pub pis: Vec<Hrn>,
    #[builder(default)]
    pub url: Option<String>,
    /// False for records answered by a peer registry.
    #[builder(default = true)]
    pub authoritative: bool,
    #[builder(default = true)]
    pub enabled: bool,
    /// Unix seconds.
    #[builder(default)]
    pub expires: Option<i64>,
    #[builder(default)]
    pub created: i64,
    #[builder(default)]
    pub last_updated: i64,
    #[builder(default)]
    pub testbed_info: Vec<TestbedField>,
}

impl Record {
    pub fn authority(&self) -> Option<Hrn> {
        self.hrn.authority()
    }

    pub fn urn(&self) -> String {
        self.hrn.to_urn(self.kind)
    }

    pub fn related(&self, relation: Relation) -> &[Hrn] {
        match relation {
            Relation::Researcher => &self.researchers,
            Relation::Pi => &self.pis,
        }
    }

    pub fn related_mut(&mut self, relation: Relation) -> &mut Vec<Hrn> {
        match relation {
            Relation::Researcher => &mut self.researchers,
            Relation::Pi => &mut self.pis,
        }
    }
}

/// Membership links between a record and user records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// slice -> user
    Researcher,
    /// authority -> user
    Pi,
}

impl Relation {
    pub fn for_kind(kind: RecordType) -> Option<Relation> {
        match kind {
            RecordType::Slice => Some(Relation::Researcher),
            RecordType::Authority => Some(Relation::Pi),
            RecordType::User | RecordType::Node => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Researcher => "researcher",
            Relation::Pi => "pi",
        }
    }
}

/// Durable record storage. Implementations must be safe to share between
/// tasks.
pub trait RecordStore: Send + Sync {
    fn get(&self, hrn: &Hrn, kind: RecordType) -> Option<Record>;

    /// Every record named `hrn`, optionally restricted to one kind.
    fn find(&self, hrn: &Hrn, kind: Option<RecordType>) -> Vec<Record>;

    /// Records whose immediate authority is `authority`.
    fn under_authority(&self, authority: &Hrn) -> Vec<Record>;

    /// Fails with `ExistingRecord` if `(kind, hrn)` is taken.
    fn insert(&self, record: Record) -> Result<(), BrokerError>;

    /// Fails with `RecordNotFound` if `(kind, hrn)` is absent.
    fn replace(&self, record: Record) -> Result<(), BrokerError>;

    fn delete(&self, hrn: &Hrn, kind: RecordType) -> bool;
}

#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<(RecordType, Hrn), Record>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, hrn: &Hrn, kind: RecordType) -> Option<Record> {
        self.records.read().get(&(kind, hrn.clone())).cloned()
    }

    fn find(&self, hrn: &Hrn, kind: Option<RecordType>) -> Vec<Record> {
        let records = self.records.read();
        match kind {
            Some(kind) => records.get(&(kind, hrn.clone())).cloned().into_iter().collect(),
            None => RecordType::ALL
                .iter()
                .filter_map(|kind| records.get(&(*kind, hrn.clone())).cloned())
                .collect(),
        }
    }

    fn under_authority(&self, authority: &Hrn) -> Vec<Record> {
        self.records
            .read()
            .values()
            .filter(|r| r.authority().as_ref() == Some(authority))
            .cloned()
            .collect()
    }

    fn insert(&self, record: Record) -> Result<(), BrokerError> {
        let mut records = self.records.write();
        let key = (record.kind, record.hrn.clone());
        if records.contains_key(&key) {
            return Err(BrokerError::ExistingRecord(record.hrn.to_string()));
        }
        records.insert(key, record);
        Ok(())
    }

    fn replace(&self, record: Record) -> Result<(), BrokerError> {
        let mut records = self.records.write();
        match records.get_mut(&(record.kind, record.hrn.clone())) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(BrokerError::RecordNotFound(record.hrn.to_string())),
        }
    }

    fn delete(&self, hrn: &Hrn, kind: RecordType) -> bool {
        self.records.write().remove(&(kind, hrn.clone())).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(hrn: &str) -> Record {
        Record::builder().hrn(Hrn::new(hrn)).kind(RecordType::User).build()
    }

    #[test]
    fn insert_rejects_duplicates_of_the_same_kind_only() {
        let store = MemoryRecordStore::new();
        store.insert(user("plc.alice")).unwrap();
        assert!(matches!(
            store.insert(user("plc.alice")),
            Err(BrokerError::ExistingRecord(_))
        ));
        let slice = Record::builder()
            .hrn(Hrn::new("plc.alice"))
            .kind(RecordType::Slice)
            .build();
        store.insert(slice).unwrap();
        assert_eq!(store.find(&Hrn::new("plc.alice"), None).len(), 2);
        assert_eq!(
            store.find(&Hrn::new("plc.alice"), Some(RecordType::Slice)).len(),
            1
        );
    }

    #[test]
    fn under_authority_only_returns_direct_children() {
        let store = MemoryRecordStore::new();
        store.insert(user("plc.alice")).unwrap();
        store.insert(user("plc.pr.bob")).unwrap();
        let direct = store.under_authority(&Hrn::new("plc"));
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].hrn, Hrn::new("plc.alice"));
    }

    #[test]
    fn replace_requires_existing_record() {
        let store = MemoryRecordStore::new();
        assert!(matches!(
            store.replace(user("plc.alice")),
            Err(BrokerError::RecordNotFound(_))
        ));
        store.insert(user("plc.alice")).unwrap();
        let mut updated = user("plc.alice");
        updated.keys = vec!["ssh-rsa AAA".into()];
        store.replace(updated.clone()).unwrap();
        assert_eq!(store.get(&Hrn::new("plc.alice"), RecordType::User), Some(updated));
        assert!(store.delete(&Hrn::new("plc.alice"), RecordType::User));
        assert!(store.is_empty());
    }
}
