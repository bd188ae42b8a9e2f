//! Slice broker: presents every configured aggregate as one federated
//! aggregate.
//!
//! Each operation runs the same protocol. The caller is taken from the first
//! credential that authorizes the operation; nothing, not even a cached
//! answer, is returned before that. A replayed call id then short-circuits
//! to the operation's neutral answer. Otherwise a credential to forward is
//! picked, and one fan-out unit per aggregate looks up the aggregate's version,
//! translates the payload into a dialect it speaks and makes the call. The
//! joined units are merged per operation, with one diagnostic per aggregate
//! attached to the answer.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, Instrument};

use super::{
    cache::{CacheSettings, TtlCache},
    error::BrokerError,
    fanout::{AggregateDiagnostic, FanOut, UnitResult, UnitStatus, WorkerPool},
    hrn::{Hrn, RecordType},
    identity::{IdentityService, Operation, SignedCredential},
    ledger::{call_span, CallLedger},
    peer::{AggregateClient, CallOptions, PeerEntry, SliceUser, SliverStatus, VersionInfo},
    rspec::{ElementMerger, Rspec, RspecMerger, RspecVersion},
    topology::Topology,
};

/// Interface version reported by GetVersion.
pub const API_VERSION: u32 = 2;

/// A merged answer plus what each aggregate contributed to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Federated<T> {
    pub value: T,
    /// One entry per aggregate the call was dispatched to, sorted by HRN.
    pub aggregates: Vec<AggregateDiagnostic>,
}

impl<T> Federated<T> {
    /// Answer with no aggregate involved, as returned on a replayed call id.
    pub fn neutral(value: T) -> Self {
        Self {
            value,
            aggregates: vec![],
        }
    }

    pub fn succeeded(&self) -> usize {
        self.aggregates
            .iter()
            .filter(|diag| diag.status == UnitStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.aggregates.len() - self.succeeded()
    }

    /// True when the call reached aggregates and none of them answered.
    pub fn all_failed(&self) -> bool {
        !self.aggregates.is_empty() && self.succeeded() == 0
    }
}

/// Splits joined units into successful payloads and per-aggregate
/// diagnostics. The result does not depend on completion order.
fn split<T>(results: Vec<UnitResult<T>>) -> (Vec<T>, Vec<AggregateDiagnostic>) {
    let mut diagnostics: Vec<AggregateDiagnostic> =
        results.iter().map(UnitResult::diagnostic).collect();
    diagnostics.sort_by(|a, b| a.aggregate.cmp(&b.aggregate));
    let values = results
        .into_iter()
        .filter_map(|result| result.outcome.ok())
        .collect();
    (values, diagnostics)
}

/// AND over the aggregates that answered; false when none did.
fn all_true(results: Vec<UnitResult<bool>>) -> Federated<bool> {
    let (values, aggregates) = split(results);
    Federated {
        value: !values.is_empty() && values.into_iter().all(|ok| ok),
        aggregates,
    }
}

/// What the slice broker keeps in the process-wide cache.
#[derive(Clone, Debug)]
pub enum Cached {
    /// Global ListResources answer, keyed by dialect.
    Resources(Federated<Rspec>),
    /// GetVersion answer of one aggregate.
    Version(VersionInfo),
}

/// The cache shared by every slice broker in the process. Create one at
/// startup and hand the same `Arc` to each broker.
pub type ResponseCache = TtlCache<String, Cached>;

fn resources_key(version: &RspecVersion) -> String {
    format!("resources:{}", version)
}

fn version_key(aggregate: &Hrn) -> String {
    format!("version:{}", aggregate)
}

/// Cached GetVersion lookups, cloned into every fan-out unit.
#[derive(Clone)]
struct VersionLookup {
    cache: Arc<ResponseCache>,
    ttl: std::time::Duration,
}

impl VersionLookup {
    async fn fetch(
        &self,
        aggregate: &Hrn,
        client: &dyn AggregateClient,
    ) -> Result<VersionInfo, BrokerError> {
        let key = version_key(aggregate);
        if let Some(Cached::Version(version)) = self.cache.get(&key) {
            trace!(aggregate = %aggregate, "version cache hit");
            return Ok(version);
        }
        let version = client.get_version().await?;
        self.cache
            .add(key, Cached::Version(version.clone()), self.ttl);
        Ok(version)
    }
}

type Target = (Hrn, Arc<dyn AggregateClient>);

pub struct SliceBroker {
    hrn: Hrn,
    topology: Arc<Topology>,
    aggregates: Vec<Target>,
    identity: Arc<IdentityService>,
    cache: Arc<ResponseCache>,
    settings: CacheSettings,
    ledger: Arc<CallLedger>,
    pool: WorkerPool,
    merger: Arc<dyn RspecMerger>,
}

impl SliceBroker {
    pub fn new(
        identity: Arc<IdentityService>,
        topology: Arc<Topology>,
        cache: Arc<ResponseCache>,
        ledger: Arc<CallLedger>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            hrn: identity.hrn().clone(),
            topology,
            aggregates: vec![],
            identity,
            cache,
            settings: CacheSettings::default(),
            ledger,
            pool,
            merger: Arc::new(ElementMerger),
        }
    }

    /// Adds an aggregate to dispatch to. Aggregates keep insertion order,
    /// which has no effect on any merged answer.
    pub fn with_aggregate(mut self, hrn: Hrn, client: Arc<dyn AggregateClient>) -> Self {
        self.aggregates.retain(|(known, _)| known != &hrn);
        self.aggregates.push((hrn, client));
        self
    }

    pub fn with_cache_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_merger(mut self, merger: Arc<dyn RspecMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn hrn(&self) -> &Hrn {
        &self.hrn
    }

    fn versions(&self) -> VersionLookup {
        VersionLookup {
            cache: self.cache.clone(),
            ttl: self.settings.version_ttl,
        }
    }

    pub fn get_version(&self) -> Result<VersionInfo, BrokerError> {
        Ok(VersionInfo {
            hrn: self.hrn.clone(),
            urn: self.hrn.to_urn(RecordType::Authority),
            api_version: API_VERSION,
            code_tag: env!("CARGO_PKG_VERSION").to_string(),
            request_rspec_versions: vec![RspecVersion::geni_v3()],
            ad_rspec_versions: vec![RspecVersion::geni_v3()],
            default_ad_rspec: RspecVersion::geni_v3(),
            peers: self
                .topology
                .aggregates()
                .into_iter()
                .map(|entry| PeerEntry {
                    hrn: entry.hrn.clone(),
                    url: entry.url(),
                })
                .collect(),
            signing_key: self.identity.encoded_public_key()?,
        })
    }

    /// Authorizes the call, then records its id. Returns the caller, or
    /// `None` when the id was already handled. A refused call leaves the
    /// ledger untouched so the id stays usable.
    fn admit(
        &self,
        op: Operation,
        target: Option<&Hrn>,
        creds: &[SignedCredential],
        opts: &CallOptions,
    ) -> Result<Option<Hrn>, BrokerError> {
        let caller = self.identity.first_authorized(creds, op, target)?.caller().clone();
        if self.ledger.already_handled(opts.call_id()) {
            return Ok(None);
        }
        Ok(Some(caller))
    }

    /// Picks the forwarded credential, then submits one unit per eligible
    /// aggregate and waits for all of them.
    async fn dispatch<T, F, Fut>(
        &self,
        caller: &Hrn,
        creds: &[SignedCredential],
        unit: F,
    ) -> Result<Vec<UnitResult<T>>, BrokerError>
    where
        T: Send + 'static,
        F: Fn(Hrn, Arc<dyn AggregateClient>, Vec<SignedCredential>) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>> + Send + 'static,
    {
        let forward = match self.identity.delegated(creds) {
            Some(delegated) => vec![delegated.clone()],
            None => vec![self.identity.own_credential()?],
        };

        let mut fanout = FanOut::new(&self.pool);
        for (hrn, client) in &self.aggregates {
            // never bounce a request back to the aggregate that sent it
            if hrn == caller && caller != &self.hrn {
                debug!(aggregate = %hrn, "skipping originating aggregate");
                continue;
            }
            fanout.submit(hrn.clone(), unit(hrn.clone(), client.clone(), forward.clone()));
        }
        debug!(caller = %caller, units = fanout.len(), "dispatched");
        Ok(fanout.join_all().await)
    }

    pub async fn list_resources(
        &self,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Federated<Rspec>, BrokerError> {
        let span = call_span(Operation::ListResources, opts.call_id());
        async move {
            let slice = match opts.slice_urn.as_deref() {
                Some(urn) => Some(Hrn::from_urn(urn)?.0),
                None => None,
            };
            let caller =
                match self.admit(Operation::ListResources, slice.as_ref(), &creds, &opts)? {
                    Some(caller) => caller,
                    None => return Ok(Federated::neutral(Rspec::default())),
                };
            let wanted = opts.rspec_version.clone().unwrap_or_default();
            let key = resources_key(&wanted);
            if slice.is_none() && opts.cached {
                if let Some(Cached::Resources(hit)) = self.cache.get(&key) {
                    trace!(version = %wanted, "resources cache hit");
                    return Ok(hit);
                }
            }

            let versions = self.versions();
            let merger = self.merger.clone();
            let results = self
                .dispatch(&caller, &creds, |hrn, client, forward| {
                    let versions = versions.clone();
                    let merger = merger.clone();
                    let wanted = wanted.clone();
                    let mut opts = opts.clone();
                    async move {
                        let version = versions.fetch(&hrn, client.as_ref()).await?;
                        opts.rspec_version = Some(version.ad_version_for(&wanted));
                        let rspec = client.list_resources(forward, opts).await?;
                        Ok(merger.translate(rspec, &wanted))
                    }
                })
                .await?;

            let (documents, aggregates) = split(results);
            let federated = Federated {
                value: self.merger.merge(&wanted, documents),
                aggregates,
            };
            if slice.is_none() && federated.succeeded() > 0 {
                self.cache.add(
                    key,
                    Cached::Resources(federated.clone()),
                    self.settings.resources_ttl,
                );
            }
            Ok(federated)
        }
        .instrument(span)
        .await
    }

    /// Shared by CreateSliver and GetTicket: both send a request document to
    /// every aggregate and merge the documents that come back.
    async fn allocate<F, Fut>(
        &self,
        op: Operation,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
        call: F,
    ) -> Result<Federated<Rspec>, BrokerError>
    where
        F: Fn(Arc<dyn AggregateClient>, String, Vec<SignedCredential>, Rspec, Vec<SliceUser>, CallOptions) -> Fut
            + Clone
            + Send
            + 'static,
        Fut: Future<Output = Result<Rspec, BrokerError>> + Send + 'static,
    {
        let span = call_span(op, opts.call_id());
        async move {
            let (slice, _) = Hrn::from_urn(&slice_urn)?;
            let caller = match self.admit(op, Some(&slice), &creds, &opts)? {
                Some(caller) => caller,
                None => return Ok(Federated::neutral(Rspec::default())),
            };
            let given = rspec.version.clone();
            let versions = self.versions();
            let merger = self.merger.clone();
            let results = self
                .dispatch(&caller, &creds, |hrn, client, forward| {
                    let versions = versions.clone();
                    let merger = merger.clone();
                    let given = given.clone();
                    let request = rspec.clone();
                    let urn = slice_urn.clone();
                    let users = users.clone();
                    let opts = opts.clone();
                    let call = call.clone();
                    async move {
                        let version = versions.fetch(&hrn, client.as_ref()).await?;
                        let request = merger.translate(request, &version.request_version_for(&given));
                        let manifest = call(client, urn, forward, request, users, opts).await?;
                        Ok(merger.translate(manifest, &given))
                    }
                })
                .await?;
            let (manifests, aggregates) = split(results);
            Ok(Federated {
                value: self.merger.merge(&given, manifests),
                aggregates,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn create_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    ) -> Result<Federated<Rspec>, BrokerError> {
        self.allocate(
            Operation::CreateSliver,
            slice_urn,
            creds,
            rspec,
            users,
            opts,
            |client, urn, creds, rspec, users, opts| async move {
                client.create_sliver(urn, creds, rspec, users, opts).await
            },
        )
        .await
    }

    pub async fn get_ticket(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    ) -> Result<Federated<Rspec>, BrokerError> {
        self.allocate(
            Operation::GetTicket,
            slice_urn,
            creds,
            rspec,
            users,
            opts,
            |client, urn, creds, rspec, users, opts| async move {
                client.get_ticket(urn, creds, rspec, users, opts).await
            },
        )
        .await
    }

    /// Runs a per-slice boolean verb on every aggregate. `merge` turns the
    /// joined units into the answer.
    async fn slice_verb<F, Fut>(
        &self,
        op: Operation,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
        call: F,
        merge: fn(Vec<UnitResult<bool>>) -> Federated<bool>,
    ) -> Result<Federated<bool>, BrokerError>
    where
        F: Fn(Arc<dyn AggregateClient>, String, Vec<SignedCredential>, CallOptions) -> Fut,
        Fut: Future<Output = Result<bool, BrokerError>> + Send + 'static,
    {
        let span = call_span(op, opts.call_id());
        async move {
            let (slice, _) = Hrn::from_urn(&slice_urn)?;
            let caller = match self.admit(op, Some(&slice), &creds, &opts)? {
                Some(caller) => caller,
                None => return Ok(Federated::neutral(true)),
            };
            let results = self
                .dispatch(&caller, &creds, |_, client, forward| {
                    call(client, slice_urn.clone(), forward, opts.clone())
                })
                .await?;
            Ok(merge(results))
        }
        .instrument(span)
        .await
    }

    /// Always answers true once every aggregate has been told.
    pub async fn delete_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Federated<bool>, BrokerError> {
        self.slice_verb(
            Operation::DeleteSliver,
            slice_urn,
            creds,
            opts,
            |client, urn, creds, opts| async move { client.delete_sliver(urn, creds, opts).await },
            |results| {
                let (_, aggregates) = split(results);
                Federated {
                    value: true,
                    aggregates,
                }
            },
        )
        .await
    }

    pub async fn renew_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        expiration: DateTime<Utc>,
        opts: CallOptions,
    ) -> Result<Federated<bool>, BrokerError> {
        self.slice_verb(
            Operation::RenewSliver,
            slice_urn,
            creds,
            opts,
            move |client, urn, creds, opts| async move {
                client.renew_sliver(urn, creds, expiration, opts).await
            },
            all_true,
        )
        .await
    }

    pub async fn start_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Federated<bool>, BrokerError> {
        self.slice_verb(
            Operation::StartSlice,
            slice_urn,
            creds,
            opts,
            |client, urn, creds, opts| async move { client.start_slice(urn, creds, opts).await },
            all_true,
        )
        .await
    }

    pub async fn stop_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Federated<bool>, BrokerError> {
        self.slice_verb(
            Operation::StopSlice,
            slice_urn,
            creds,
            opts,
            |client, urn, creds, opts| async move { client.stop_slice(urn, creds, opts).await },
            all_true,
        )
        .await
    }

    pub async fn reset_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Federated<bool>, BrokerError> {
        self.slice_verb(
            Operation::ResetSlice,
            slice_urn,
            creds,
            opts,
            |client, urn, creds, opts| async move { client.reset_slice(urn, creds, opts).await },
            all_true,
        )
        .await
    }

    pub async fn shutdown(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Federated<bool>, BrokerError> {
        self.slice_verb(
            Operation::Shutdown,
            slice_urn,
            creds,
            opts,
            |client, urn, creds, opts| async move { client.shutdown(urn, creds, opts).await },
            all_true,
        )
        .await
    }

    pub async fn sliver_status(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Federated<SliverStatus>, BrokerError> {
        let span = call_span(Operation::SliverStatus, opts.call_id());
        async move {
            let (slice, _) = Hrn::from_urn(&slice_urn)?;
            let caller = match self.admit(Operation::SliverStatus, Some(&slice), &creds, &opts)? {
                Some(caller) => caller,
                None => return Ok(Federated::neutral(SliverStatus::default())),
            };
            let results = self
                .dispatch(&caller, &creds, |_, client, forward| {
                    let urn = slice_urn.clone();
                    let opts = opts.clone();
                    async move { client.sliver_status(urn, forward, opts).await }
                })
                .await?;

            let (statuses, aggregates) = split(results);
            let mut resources: Vec<_> = statuses
                .into_iter()
                .filter(|status| !status.is_neutral())
                .flat_map(|status| status.resources)
                .collect();
            resources.sort_by(|a, b| a.urn.cmp(&b.urn));
            let status = if resources.is_empty() {
                SliverStatus::UNKNOWN
            } else {
                SliverStatus::READY
            };
            Ok(Federated {
                value: SliverStatus {
                    urn: slice_urn,
                    status: status.to_string(),
                    resources,
                },
                aggregates,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn list_slices(
        &self,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Federated<Vec<String>>, BrokerError> {
        let span = call_span(Operation::ListSlices, opts.call_id());
        async move {
            let caller = match self.admit(Operation::ListSlices, None, &creds, &opts)? {
                Some(caller) => caller,
                None => return Ok(Federated::neutral(vec![])),
            };
            let results = self
                .dispatch(&caller, &creds, |_, client, forward| {
                    let opts = opts.clone();
                    async move { client.list_slices(forward, opts).await }
                })
                .await?;
            let (lists, aggregates) = split(results);
            let mut slices: Vec<String> = lists.into_iter().flatten().collect();
            slices.sort();
            Ok(Federated {
                value: slices,
                aggregates,
            })
        }
        .instrument(span)
        .await
    }
}
