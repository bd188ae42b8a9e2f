#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedbroker::broker::{
    error::BrokerError,
    hrn::{Hrn, RecordType},
    identity::{CredentialBody, IdentityService, SignedCredential},
    peer::{
        AggregateClient, CallOptions, RegistryClient, ResourceStatus, SliceUser, SliverStatus,
        TestbedDriver, VersionInfo,
    },
    record::{Record, Relation},
    registry::RegistryBroker,
    rspec::{Rspec, RspecVersion},
};
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    Failing,
    Panicking,
}

/// In-process aggregate with scripted answers and per-verb call counters.
pub struct MockAggregate {
    pub hrn: Hrn,
    pub behavior: Behavior,
    pub resources: Vec<String>,
    pub slices: Vec<String>,
    pub renew_result: bool,
    /// Answer SliverStatus with the neutral value.
    pub neutral_status: bool,
    pub delay: Duration,
    /// The only rspec dialect this aggregate reads and writes.
    pub dialect: RspecVersion,
    /// Credentials received, one entry per call.
    pub seen_creds: Mutex<Vec<Vec<SignedCredential>>>,
    /// Dialect each received request or listing asked for.
    pub seen_versions: Mutex<Vec<RspecVersion>>,
    pub version_calls: AtomicUsize,
    pub resource_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub slice_calls: AtomicUsize,
    pub control_calls: AtomicUsize,
}

impl MockAggregate {
    pub fn new(hrn: &str, behavior: Behavior) -> Self {
        Self {
            hrn: Hrn::new(hrn),
            behavior,
            resources: vec![format!("<node id=\"{}\"/>", hrn)],
            slices: vec![],
            renew_result: true,
            neutral_status: false,
            delay: Duration::ZERO,
            dialect: RspecVersion::geni_v3(),
            seen_creds: Mutex::new(vec![]),
            seen_versions: Mutex::new(vec![]),
            version_calls: AtomicUsize::new(0),
            resource_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            slice_calls: AtomicUsize::new(0),
            control_calls: AtomicUsize::new(0),
        }
    }

    pub fn healthy(hrn: &str) -> Self {
        Self::new(hrn, Behavior::Healthy)
    }

    pub fn with_slices(mut self, slices: &[&str]) -> Self {
        self.slices = slices.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_renew(mut self, result: bool) -> Self {
        self.renew_result = result;
        self
    }

    pub fn with_neutral_status(mut self) -> Self {
        self.neutral_status = true;
        self
    }

    pub fn with_dialect(mut self, dialect: RspecVersion) -> Self {
        self.dialect = dialect;
        self
    }

    fn observe(&self, creds: &[SignedCredential], version: Option<&RspecVersion>) {
        self.seen_creds.lock().push(creds.to_vec());
        if let Some(version) = version {
            self.seen_versions.lock().push(version.clone());
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn enter(&self, counter: &AtomicUsize) -> Result<(), BrokerError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behavior {
            Behavior::Healthy => Ok(()),
            Behavior::Failing => Err(BrokerError::Transport(format!("{} unreachable", self.hrn))),
            Behavior::Panicking => panic!("{} crashed", self.hrn),
        }
    }
}

#[async_trait]
impl AggregateClient for MockAggregate {
    async fn get_version(&self) -> Result<VersionInfo, BrokerError> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        Ok(VersionInfo {
            hrn: self.hrn.clone(),
            urn: self.hrn.to_urn(RecordType::Authority),
            api_version: 2,
            code_tag: "mock".into(),
            request_rspec_versions: vec![self.dialect.clone()],
            ad_rspec_versions: vec![self.dialect.clone()],
            default_ad_rspec: self.dialect.clone(),
            peers: vec![],
            signing_key: vec![],
        })
    }

    async fn list_resources(
        &self,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Rspec, BrokerError> {
        self.observe(&creds, opts.rspec_version.as_ref());
        self.enter(&self.resource_calls).await?;
        Ok(Rspec::new(self.dialect.clone(), self.resources.clone()))
    }

    async fn create_sliver(
        &self,
        _slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        _users: Vec<SliceUser>,
        _opts: CallOptions,
    ) -> Result<Rspec, BrokerError> {
        self.observe(&creds, Some(&rspec.version));
        self.enter(&self.create_calls).await?;
        Ok(Rspec::new(
            self.dialect.clone(),
            vec![format!("<sliver am=\"{}\"/>", self.hrn)],
        ))
    }

    async fn delete_sliver(
        &self,
        _slice_urn: String,
        _creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.enter(&self.control_calls).await?;
        Ok(true)
    }

    async fn renew_sliver(
        &self,
        _slice_urn: String,
        _creds: Vec<SignedCredential>,
        _expiration: DateTime<Utc>,
        _opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.enter(&self.control_calls).await?;
        Ok(self.renew_result)
    }

    async fn sliver_status(
        &self,
        slice_urn: String,
        _creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<SliverStatus, BrokerError> {
        self.enter(&self.control_calls).await?;
        if self.neutral_status {
            return Ok(SliverStatus::default());
        }
        Ok(SliverStatus {
            urn: slice_urn,
            status: SliverStatus::READY.into(),
            resources: vec![ResourceStatus {
                urn: format!("urn:sliver:{}", self.hrn),
                status: SliverStatus::READY.into(),
                error: None,
            }],
        })
    }

    async fn list_slices(
        &self,
        creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<Vec<String>, BrokerError> {
        self.observe(&creds, None);
        self.enter(&self.slice_calls).await?;
        Ok(self.slices.clone())
    }

    async fn get_ticket(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    ) -> Result<Rspec, BrokerError> {
        self.create_sliver(slice_urn, creds, rspec, users, opts).await
    }

    async fn start_slice(
        &self,
        _slice_urn: String,
        _creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.enter(&self.control_calls).await?;
        Ok(true)
    }

    async fn stop_slice(
        &self,
        _slice_urn: String,
        _creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.enter(&self.control_calls).await?;
        Ok(true)
    }

    async fn reset_slice(
        &self,
        _slice_urn: String,
        _creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.enter(&self.control_calls).await?;
        Ok(true)
    }

    async fn shutdown(
        &self,
        _slice_urn: String,
        _creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.enter(&self.control_calls).await?;
        Ok(true)
    }
}

/// Reaches another in-process registry broker without a network hop.
pub struct LocalRegistry(pub Arc<RegistryBroker>);

#[async_trait]
impl RegistryClient for LocalRegistry {
    async fn get_version(&self) -> Result<VersionInfo, BrokerError> {
        self.0.get_version()
    }

    async fn resolve(
        &self,
        names: Vec<Hrn>,
        creds: Vec<SignedCredential>,
        kind: Option<RecordType>,
        full: bool,
        opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError> {
        self.0.resolve(names, creds, kind, full, opts).await
    }

    async fn list(
        &self,
        container: Hrn,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError> {
        self.0.list(container, creds, opts).await
    }

    async fn remove(
        &self,
        hrn: Hrn,
        kind: Option<RecordType>,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        let kind = kind.map(|kind| kind.to_string());
        self.0
            .remove(hrn.as_str(), kind.as_deref(), creds, opts)
            .await
    }
}

/// Peer registry that is always down. Counts the removes it was sent.
#[derive(Default)]
pub struct DeadRegistry {
    pub removes: AtomicUsize,
}

#[async_trait]
impl RegistryClient for DeadRegistry {
    async fn get_version(&self) -> Result<VersionInfo, BrokerError> {
        Err(BrokerError::Transport("down".into()))
    }

    async fn resolve(
        &self,
        _names: Vec<Hrn>,
        _creds: Vec<SignedCredential>,
        _kind: Option<RecordType>,
        _full: bool,
        _opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError> {
        Err(BrokerError::Transport("down".into()))
    }

    async fn list(
        &self,
        _container: Hrn,
        _creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError> {
        Err(BrokerError::Transport("down".into()))
    }

    async fn remove(
        &self,
        _hrn: Hrn,
        _kind: Option<RecordType>,
        _creds: Vec<SignedCredential>,
        _opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::Transport("down".into()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationChange {
    pub subject: Hrn,
    pub relation: Relation,
    pub added: Vec<Hrn>,
    pub removed: Vec<Hrn>,
}

/// Driver that records relation deltas and can be told to fail removal.
#[derive(Default)]
pub struct RecordingDriver {
    pub changes: Mutex<Vec<RelationChange>>,
    pub fail_remove: bool,
    pub removed: AtomicUsize,
}

#[async_trait]
impl TestbedDriver for RecordingDriver {
    async fn augment(&self, records: &mut [Record]) -> Result<(), BrokerError> {
        for record in records.iter_mut() {
            record.testbed_info.push(fedbroker::broker::record::TestbedField {
                key: "site".into(),
                value: "mock".into(),
            });
        }
        Ok(())
    }

    async fn register(&self, record: &Record) -> Result<String, BrokerError> {
        Ok(format!("ptr-{}", record.hrn.leaf()))
    }

    async fn update(&self, _old: &Record, _new: &Record) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn remove(&self, _record: &Record) -> Result<(), BrokerError> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove {
            return Err(BrokerError::Driver("native delete failed".into()));
        }
        Ok(())
    }

    async fn update_relation(
        &self,
        subject: &Record,
        relation: Relation,
        added: &[Hrn],
        removed: &[Hrn],
    ) -> Result<(), BrokerError> {
        self.changes.lock().push(RelationChange {
            subject: subject.hrn.clone(),
            relation,
            added: added.to_vec(),
            removed: removed.to_vec(),
        });
        Ok(())
    }
}

/// A credential issued by `issuer` letting `caller` do everything `rights`
/// allow below `object`.
pub fn credential(
    issuer: &IdentityService,
    caller: &str,
    object: &str,
    rights: &[&str],
) -> SignedCredential {
    issuer
        .mint(
            CredentialBody::builder()
                .caller(Hrn::new(caller))
                .object(Hrn::new(object))
                .object_kind(RecordType::Authority)
                .issuer(issuer.hrn().clone())
                .rights(rights.iter().map(|r| r.to_string()).collect())
                .expires(Utc::now().timestamp() + 3600)
                .build(),
        )
        .unwrap()
}

pub fn slice_urn(hrn: &str) -> String {
    Hrn::new(hrn).to_urn(RecordType::Slice)
}

pub fn user(hrn: &str) -> Record {
    Record::builder()
        .hrn(Hrn::new(hrn))
        .kind(RecordType::User)
        .keys(vec![format!("ssh-ed25519 {}", hrn)])
        .build()
}
