//! Federation registry broker.
//!
//! Answers record operations for the authorities hosted here and forwards
//! the rest to the peer registry that owns them. Ownership is decided by the
//! longest authority prefix of a name, computed once at startup from the
//! topology.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::{join_all, try_join_all};
use hashbrown::HashMap;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, warn, Instrument};

use super::{
    error::BrokerError,
    fanout::best_effort,
    hrn::{Hrn, RecordType},
    identity::{
        decode_public_key, verify_proof, Challenge, ChallengeBook, ChallengeProof, CredentialBody,
        HierarchyRights, IdentityService, Operation, RightsPolicy, SignedCredential,
        DEFAULT_CREDENTIAL_DAYS,
    },
    ledger::{call_span, CallLedger},
    peer::{CallOptions, NullDriver, PeerEntry, RegistryClient, TestbedDriver, VersionInfo},
    record::{Record, RecordStore, Relation},
    rspec::RspecVersion,
    topology::Topology,
    trie::AuthorityTrie,
};

/// Interface version reported by GetVersion.
pub const API_VERSION: u32 = 2;

/// Who is asking for a credential.
#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
pub enum Requester {
    /// A caller proving its identity with credentials it already holds.
    Credentials(Vec<SignedCredential>),
    /// The object itself, answering a challenge from
    /// [`RegistryBroker::get_challenge`] with the key on its record.
    SelfCertified(ChallengeProof),
}

pub struct RegistryBroker {
    hrn: Hrn,
    router: AuthorityTrie,
    topology: Arc<Topology>,
    peers: HashMap<Hrn, Arc<dyn RegistryClient>>,
    store: Arc<dyn RecordStore>,
    driver: Arc<dyn TestbedDriver>,
    identity: Arc<IdentityService>,
    policy: Arc<dyn RightsPolicy>,
    ledger: Arc<CallLedger>,
    challenges: ChallengeBook,
}

impl RegistryBroker {
    /// The prefix router is built here from every configured registry plus
    /// our own authority and never changes afterwards.
    pub fn new(
        identity: Arc<IdentityService>,
        topology: Arc<Topology>,
        store: Arc<dyn RecordStore>,
        ledger: Arc<CallLedger>,
    ) -> Self {
        let hrn = identity.hrn().clone();
        let mut router = AuthorityTrie::from_authorities(
            topology.registries().into_iter().map(|entry| &entry.hrn),
        );
        router.insert(&hrn);
        Self {
            hrn,
            router,
            topology,
            peers: HashMap::new(),
            store,
            driver: Arc::new(NullDriver),
            identity,
            policy: Arc::new(HierarchyRights),
            ledger,
            challenges: ChallengeBook::default(),
        }
    }

    pub fn with_peer(mut self, hrn: Hrn, client: Arc<dyn RegistryClient>) -> Self {
        self.peers.insert(hrn, client);
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn TestbedDriver>) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn RightsPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn hrn(&self) -> &Hrn {
        &self.hrn
    }

    /// The owning authority of `hrn`, if it lives under any known one.
    pub fn owner_of(&self, hrn: &Hrn) -> Option<Hrn> {
        self.router.best_match(hrn)
    }

    fn peer_for(&self, authority: &Hrn) -> Option<&Arc<dyn RegistryClient>> {
        if authority == &self.hrn {
            return None;
        }
        self.peers.get(authority)
    }

    /// What we send on: whatever the caller presented, plus our own
    /// credential so a peer that trusts us can always authorize the call.
    fn forward_creds(&self, creds: &[SignedCredential]) -> Result<Vec<SignedCredential>, BrokerError> {
        let mut forward = creds.to_vec();
        forward.push(self.identity.own_credential()?);
        Ok(forward)
    }

    pub fn get_version(&self) -> Result<VersionInfo, BrokerError> {
        Ok(VersionInfo {
            hrn: self.hrn.clone(),
            urn: self.hrn.to_urn(RecordType::Authority),
            api_version: API_VERSION,
            code_tag: env!("CARGO_PKG_VERSION").to_string(),
            request_rspec_versions: vec![],
            ad_rspec_versions: vec![],
            default_ad_rspec: RspecVersion::geni_v3(),
            peers: self
                .topology
                .registries()
                .into_iter()
                .map(|entry| PeerEntry {
                    hrn: entry.hrn.clone(),
                    url: entry.url(),
                })
                .collect(),
            signing_key: self.identity.encoded_public_key()?,
        })
    }

    pub async fn resolve(
        &self,
        names: Vec<Hrn>,
        creds: Vec<SignedCredential>,
        kind: Option<RecordType>,
        full: bool,
        opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError> {
        let span = call_span(Operation::Resolve, opts.call_id());
        async move {
            self.identity.first_authorized(&creds, Operation::Resolve, None)?;
            if self.ledger.already_handled(opts.call_id()) {
                return Ok(vec![]);
            }

            let mut local = Vec::new();
            let mut remote: HashMap<Hrn, Vec<Hrn>> = HashMap::new();
            let mut matched_any = false;
            for name in &names {
                match self.owner_of(name) {
                    Some(owner) => {
                        matched_any = true;
                        match self.peer_for(&owner) {
                            Some(_) => remote.entry(owner).or_default().push(name.clone()),
                            None => local.push(name.clone()),
                        }
                    }
                    None => local.push(name.clone()),
                }
            }
            debug!(local = local.len(), remote = remote.len(), "partitioned names");

            let forward = if remote.is_empty() {
                vec![]
            } else {
                self.forward_creds(&creds)?
            };
            // a peer that cannot answer fails the whole call rather than
            // reporting its records as missing
            let forwarded = remote.into_iter().filter_map(|(owner, group)| {
                let client = self.peer_for(&owner)?.clone();
                let forward = forward.clone();
                let opts = opts.clone();
                Some(async move {
                    client
                        .resolve(group, forward, kind, full, opts)
                        .await
                        .map_err(|err| {
                            warn!(peer = %owner, error = %err, "forwarded resolve failed");
                            err
                        })
                })
            });
            let mut records: Vec<Record> = try_join_all(forwarded)
                .await?
                .into_iter()
                .flatten()
                .map(|mut record| {
                    record.authoritative = false;
                    record
                })
                .collect();

            let mut found: Vec<Record> = local
                .iter()
                .flat_map(|name| self.store.find(name, None))
                .collect();
            if full {
                self.driver.augment(&mut found).await?;
                for record in found.iter_mut() {
                    if record.kind == RecordType::Authority {
                        record.url = self.topology.url_of(&record.hrn);
                    }
                }
            }
            records.extend(found);

            if let Some(kind) = kind {
                records.retain(|record| record.kind == kind);
            }
            if records.is_empty() {
                let names = names
                    .iter()
                    .map(Hrn::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(if matched_any {
                    BrokerError::RecordNotFound(names)
                } else {
                    BrokerError::MissingAuthority(names)
                });
            }
            Ok(records)
        }
        .instrument(span)
        .await
    }

    pub async fn list(
        &self,
        container: Hrn,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError> {
        let span = call_span(Operation::List, opts.call_id());
        async move {
            self.identity
                .first_authorized(&creds, Operation::List, Some(&container))?;
            if self.ledger.already_handled(opts.call_id()) {
                return Ok(vec![]);
            }

            if let Some(owner) = self.owner_of(&container) {
                if let Some(client) = self.peer_for(&owner) {
                    debug!(peer = %owner, "forwarding list");
                    let forward = self.forward_creds(&creds)?;
                    let mut records = client.list(container, forward, opts).await?;
                    records.iter_mut().for_each(|record| record.authoritative = false);
                    return Ok(records);
                }
            }
            if !self.identity.knows_authority(&container)
                && self.store.get(&container, RecordType::Authority).is_none()
            {
                return Err(BrokerError::MissingAuthority(container.to_string()));
            }
            Ok(self.store.under_authority(&container))
        }
        .instrument(span)
        .await
    }

    /// Creates a record and returns its identity material.
    pub async fn register(
        &self,
        record: Record,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<String, BrokerError> {
        let span = call_span(Operation::Register, opts.call_id());
        async move {
            self.identity
                .first_authorized(&creds, Operation::Register, Some(&record.hrn))?;
            if self.ledger.already_handled(opts.call_id()) {
                return Ok(String::new());
            }
            if let Some(key) = record.signing_key.as_deref() {
                decode_public_key(key)?;
            }
            if self.store.get(&record.hrn, record.kind).is_some() {
                return Err(BrokerError::ExistingRecord(record.hrn.to_string()));
            }

            let mut record = record;
            let gid = match (record.kind, record.gid.take()) {
                (RecordType::Authority, _) => self.identity.create_authority(&record.hrn),
                (_, Some(gid)) => gid,
                (_, None) => self
                    .identity
                    .create_gid(&record.hrn, record.keys.first().map(String::as_str)),
            };
            let now = Utc::now().timestamp();
            record.gid = Some(gid.clone());
            record.authoritative = true;
            record.url = None;
            record.created = now;
            record.last_updated = now;

            let pointer = self.driver.register(&record).await?;
            record.pointer = Some(pointer);
            self.store.insert(record.clone())?;
            debug!(hrn = %record.hrn, kind = %record.kind, "registered");

            if let Some(relation) = Relation::for_kind(record.kind) {
                let desired = record.related(relation).to_vec();
                let effective = self.reconcile(&record, relation, &[], &desired).await?;
                if effective != desired {
                    *record.related_mut(relation) = effective;
                    self.store.replace(record)?;
                }
            }
            Ok(gid)
        }
        .instrument(span)
        .await
    }

    pub async fn update(
        &self,
        record: Record,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        let span = call_span(Operation::Update, opts.call_id());
        async move {
            self.identity
                .first_authorized(&creds, Operation::Update, Some(&record.hrn))?;
            if self.ledger.already_handled(opts.call_id()) {
                return Ok(true);
            }
            if let Some(key) = record.signing_key.as_deref() {
                decode_public_key(key)?;
            }
            let old = self
                .store
                .get(&record.hrn, record.kind)
                .ok_or_else(|| BrokerError::RecordNotFound(record.hrn.to_string()))?;

            let mut new = record;
            // the stored pointer wins over anything the client sent
            new.pointer = old.pointer.clone();
            new.created = old.created;
            new.last_updated = Utc::now().timestamp();
            new.authoritative = true;
            if new.signing_key.is_none() {
                new.signing_key = old.signing_key.clone();
            }
            new.gid = if new.kind == RecordType::User && new.keys != old.keys {
                debug!(hrn = %new.hrn, "keys changed, regenerating gid");
                Some(
                    self.identity
                        .create_gid(&new.hrn, new.keys.first().map(String::as_str)),
                )
            } else {
                old.gid.clone()
            };

            self.driver.update(&old, &new).await?;
            self.store.replace(new.clone())?;

            if let Some(relation) = Relation::for_kind(new.kind) {
                let desired = new.related(relation).to_vec();
                let effective = self
                    .reconcile(&new, relation, old.related(relation), &desired)
                    .await?;
                if effective != desired {
                    *new.related_mut(relation) = effective;
                    self.store.replace(new)?;
                }
            }
            Ok(true)
        }
        .instrument(span)
        .await
    }

    /// Applies the membership delta between `previous` and `desired` on the
    /// testbed side and returns the list to store. Names without a user
    /// record are dropped.
    async fn reconcile(
        &self,
        subject: &Record,
        relation: Relation,
        previous: &[Hrn],
        desired: &[Hrn],
    ) -> Result<Vec<Hrn>, BrokerError> {
        let mut effective: Vec<Hrn> = desired
            .iter()
            .filter(|hrn| {
                let known = self.store.get(hrn, RecordType::User).is_some();
                if !known {
                    debug!(user = %hrn, relation = relation.as_str(), "dropping unknown user");
                }
                known
            })
            .cloned()
            .collect();
        effective.sort();
        effective.dedup();

        let added: Vec<Hrn> = effective
            .iter()
            .filter(|hrn| !previous.contains(hrn))
            .cloned()
            .collect();
        let removed: Vec<Hrn> = previous
            .iter()
            .filter(|hrn| !effective.contains(hrn))
            .cloned()
            .collect();
        if !added.is_empty() || !removed.is_empty() {
            debug!(
                subject = %subject.hrn,
                relation = relation.as_str(),
                added = added.len(),
                removed = removed.len(),
                "reconciling relation"
            );
            self.driver
                .update_relation(subject, relation, &added, &removed)
                .await?;
        }
        Ok(effective)
    }

    pub async fn remove(
        &self,
        xrn: &str,
        kind: Option<&str>,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        let span = call_span(Operation::Remove, opts.call_id());
        async move {
            let (hrn, urn_kind) = Hrn::parse_xrn(xrn)?;
            self.identity
                .first_authorized(&creds, Operation::Remove, Some(&hrn))?;
            if self.ledger.already_handled(opts.call_id()) {
                return Ok(true);
            }

            let candidates = self.store.find(&hrn, None);
            if candidates.is_empty() {
                return Err(BrokerError::RecordNotFound(hrn.to_string()));
            }
            let wanted = match kind {
                Some(kind) => Some(kind.parse::<RecordType>()?),
                None => urn_kind,
            };
            let record = candidates
                .into_iter()
                .find(|record| wanted.map_or(true, |kind| record.kind == kind))
                .ok_or_else(|| BrokerError::RecordNotFound(hrn.to_string()))?;

            if self.owner_of(&hrn).as_ref() == Some(&self.hrn) && !self.peers.is_empty() {
                let forward = self.forward_creds(&creds)?;
                let propagations = self
                    .peers
                    .iter()
                    .filter(|(peer, _)| *peer != &self.hrn)
                    .map(|(peer, client)| {
                        let fut = client.remove(
                            hrn.clone(),
                            Some(record.kind),
                            forward.clone(),
                            opts.clone(),
                        );
                        async move { best_effort("remove propagation", peer, fut).await }
                    });
                join_all(propagations).await;
            }

            if best_effort("driver remove", &hrn, self.driver.remove(&record))
                .await
                .is_none()
            {
                warn!(hrn = %hrn, "removing record despite driver failure");
            }
            self.store.delete(&record.hrn, record.kind);
            debug!(hrn = %hrn, kind = %record.kind, "removed");
            Ok(true)
        }
        .instrument(span)
        .await
    }

    /// Hands out a challenge the object named by `xrn` signs to request a
    /// credential as itself.
    pub fn get_challenge(&self, xrn: &str) -> Result<Challenge, BrokerError> {
        let (hrn, _) = Hrn::parse_xrn(xrn)?;
        Ok(self.challenges.issue(hrn))
    }

    /// Mints a credential over the object named by `xrn`.
    pub async fn get_credential(
        &self,
        xrn: &str,
        kind: &str,
        requester: Requester,
    ) -> Result<SignedCredential, BrokerError> {
        let span = call_span(Operation::GetCredential, None);
        async move {
            let kind: RecordType = kind.parse()?;
            let (hrn, _) = Hrn::parse_xrn(xrn)?;
            let record = self
                .store
                .get(&hrn, kind)
                .ok_or_else(|| BrokerError::RecordNotFound(hrn.to_string()))?;
            if !self.driver.is_enabled(&record) {
                return Err(BrokerError::AccountNotEnabled(hrn.to_string()));
            }

            let caller = match requester {
                Requester::SelfCertified(proof) => {
                    self.challenges.redeem(&proof.challenge, &hrn)?;
                    let key = record.signing_key.as_deref().ok_or_else(|| {
                        BrokerError::Unauthorized(format!("{} has no signing key", hrn))
                    })?;
                    verify_proof(key, &proof)?;
                    record.hrn.clone()
                }
                Requester::Credentials(creds) => self
                    .identity
                    .first_authorized(&creds, Operation::GetCredential, None)?
                    .caller()
                    .clone(),
            };

            let rights = self.policy.determine_rights(&caller, &record);
            if rights.is_empty() {
                return Err(BrokerError::PermissionError(format!(
                    "{} has no rights over {}",
                    caller, hrn
                )));
            }
            let expires = record
                .expires
                .unwrap_or_else(|| (Utc::now() + Duration::days(DEFAULT_CREDENTIAL_DAYS)).timestamp());
            debug!(caller = %caller, object = %hrn, rights = ?rights, "minting credential");
            self.identity.mint(
                CredentialBody::builder()
                    .caller(caller)
                    .object(record.hrn.clone())
                    .object_kind(record.kind)
                    .issuer(self.hrn.clone())
                    .rights(rights)
                    .delegate(true)
                    .expires(expires)
                    .build(),
            )
        }
        .instrument(span)
        .await
    }
}
