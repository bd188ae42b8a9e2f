//! Typed seams to everything outside the broker core: remote registries and
//! aggregates (one method per remote verb) and the testbed driver hooks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize, Serialize};

use super::{
    error::BrokerError,
    hrn::{Hrn, RecordType},
    identity::SignedCredential,
    record::{Record, Relation},
    rspec::{Rspec, RspecVersion},
};

/// Options recognized on aggregation and registry calls.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct CallOptions {
    /// Idempotency token; repeated ids short-circuit.
    pub call_id: Option<String>,
    /// Allow answering from the read cache.
    pub cached: bool,
    /// Dialect the caller wants back (`geni_rspec_version`).
    pub rspec_version: Option<RspecVersion>,
    /// Merge-vs-replace hint for downstream aggregates; not read here.
    pub append: bool,
    /// Restricts ListResources to one slice (`geni_slice_urn`).
    pub slice_urn: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            call_id: None,
            cached: true,
            rspec_version: None,
            append: false,
            slice_urn: None,
        }
    }
}

impl CallOptions {
    pub fn with_call_id(call_id: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..Self::default()
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct PeerEntry {
    pub hrn: Hrn,
    pub url: String,
}

/// Answer to GetVersion.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct VersionInfo {
    pub hrn: Hrn,
    pub urn: String,
    pub api_version: u32,
    pub code_tag: String,
    pub request_rspec_versions: Vec<RspecVersion>,
    pub ad_rspec_versions: Vec<RspecVersion>,
    pub default_ad_rspec: RspecVersion,
    pub peers: Vec<PeerEntry>,
    /// Encoded public key the service signs credentials with.
    pub signing_key: Vec<u8>,
}

impl VersionInfo {
    /// The advertisement dialect to ask this peer for when the caller wants
    /// `wanted`.
    pub fn ad_version_for(&self, wanted: &RspecVersion) -> RspecVersion {
        if self.ad_rspec_versions.contains(wanted) {
            wanted.clone()
        } else {
            self.default_ad_rspec.clone()
        }
    }

    /// The request dialect to send this peer for a request written in
    /// `given`.
    pub fn request_version_for(&self, given: &RspecVersion) -> RspecVersion {
        if self.request_rspec_versions.contains(given) {
            given.clone()
        } else {
            self.request_rspec_versions
                .first()
                .cloned()
                .unwrap_or_else(|| self.default_ad_rspec.clone())
        }
    }
}

/// A user to provision into a sliver.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct SliceUser {
    pub urn: String,
    pub keys: Vec<String>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ResourceStatus {
    pub urn: String,
    pub status: String,
    pub error: Option<String>,
}

/// Answer to SliverStatus. The default value is the neutral "nothing known"
/// answer a peer gives on a replayed call id.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct SliverStatus {
    pub urn: String,
    pub status: String,
    pub resources: Vec<ResourceStatus>,
}

impl SliverStatus {
    pub const READY: &'static str = "ready";
    pub const UNKNOWN: &'static str = "unknown";

    pub fn is_neutral(&self) -> bool {
        self.urn.is_empty() && self.status.is_empty() && self.resources.is_empty()
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn get_version(&self) -> Result<VersionInfo, BrokerError>;

    async fn resolve(
        &self,
        names: Vec<Hrn>,
        creds: Vec<SignedCredential>,
        kind: Option<RecordType>,
        full: bool,
        opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError>;

    async fn list(
        &self,
        container: Hrn,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError>;

    async fn remove(
        &self,
        hrn: Hrn,
        kind: Option<RecordType>,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError>;
}

#[async_trait]
pub trait AggregateClient: Send + Sync {
    async fn get_version(&self) -> Result<VersionInfo, BrokerError>;

    async fn list_resources(
        &self,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Rspec, BrokerError>;

    async fn create_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    ) -> Result<Rspec, BrokerError>;

    async fn delete_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError>;

    async fn renew_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        expiration: DateTime<Utc>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError>;

    async fn sliver_status(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<SliverStatus, BrokerError>;

    async fn list_slices(
        &self,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Vec<String>, BrokerError>;

    async fn get_ticket(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    ) -> Result<Rspec, BrokerError>;

    async fn start_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError>;

    async fn stop_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError>;

    async fn reset_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError>;

    async fn shutdown(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError>;
}

/// Testbed-specific side of record management.
#[async_trait]
pub trait TestbedDriver: Send + Sync {
    /// Adds testbed detail to records answered locally with `full` set.
    async fn augment(&self, _records: &mut [Record]) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Creates the native object and returns its pointer.
    async fn register(&self, record: &Record) -> Result<String, BrokerError>;

    async fn update(&self, old: &Record, new: &Record) -> Result<(), BrokerError>;

    async fn remove(&self, record: &Record) -> Result<(), BrokerError>;

    /// Applies a membership delta on the native side.
    async fn update_relation(
        &self,
        subject: &Record,
        relation: Relation,
        added: &[Hrn],
        removed: &[Hrn],
    ) -> Result<(), BrokerError>;

    fn is_enabled(&self, record: &Record) -> bool {
        record.enabled
    }
}

/// Driver for a registry with no testbed behind it.
#[derive(Default, Clone, Copy, Debug)]
pub struct NullDriver;

/// Pointer given to records that have no native counterpart.
pub const NULL_POINTER: &str = "-1";

#[async_trait]
impl TestbedDriver for NullDriver {
    async fn register(&self, _record: &Record) -> Result<String, BrokerError> {
        Ok(NULL_POINTER.to_string())
    }

    async fn update(&self, _old: &Record, _new: &Record) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn remove(&self, _record: &Record) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn update_relation(
        &self,
        _subject: &Record,
        _relation: Relation,
        _added: &[Hrn],
        _removed: &[Hrn],
    ) -> Result<(), BrokerError> {
        Ok(())
    }
}
