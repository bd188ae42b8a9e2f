mod common;

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};

use common::{credential, user, DeadRegistry, LocalRegistry, RecordingDriver, RelationChange};
use fedbroker::broker::{
    error::BrokerError,
    hrn::{Hrn, RecordType},
    identity::{IdentityService, SignedCredential},
    ledger::CallLedger,
    peer::CallOptions,
    record::{MemoryRecordStore, Record, RecordStore, Relation},
    registry::{RegistryBroker, Requester},
    topology::{InterfaceDescriptor, Topology},
};

fn descriptor(hrn: &str, port: u16) -> InterfaceDescriptor {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    InterfaceDescriptor::new(Hrn::new(hrn), addr, "localhost")
}

fn federation() -> Arc<Topology> {
    Arc::new(
        Topology::new(vec![descriptor("plc", 12345), descriptor("ple", 12346)], vec![]).unwrap(),
    )
}

struct Site {
    identity: Arc<IdentityService>,
    store: Arc<MemoryRecordStore>,
}

impl Site {
    fn new(hrn: &str) -> Self {
        Self {
            identity: Arc::new(IdentityService::generate(Hrn::new(hrn))),
            store: Arc::new(MemoryRecordStore::new()),
        }
    }

    fn broker(&self) -> RegistryBroker {
        RegistryBroker::new(
            self.identity.clone(),
            federation(),
            self.store.clone(),
            Arc::new(CallLedger::new()),
        )
    }

    fn admin(&self) -> Vec<SignedCredential> {
        vec![self.identity.own_credential().unwrap()]
    }
}

/// plc with ple as a live peer. ple trusts plc's key so forwarded calls
/// authorize there.
async fn plc_and_ple() -> (Site, RegistryBroker, Site) {
    let plc = Site::new("plc");
    let ple = Site::new("ple");
    ple.identity
        .trust(Hrn::new("plc"), plc.identity.public_key().clone());

    let ple_broker = ple.broker();
    ple_broker
        .register(user("ple.bob"), ple.admin(), CallOptions::default())
        .await
        .unwrap();
    let plc_broker = plc
        .broker()
        .with_peer(Hrn::new("ple"), Arc::new(LocalRegistry(Arc::new(ple_broker))));
    (plc, plc_broker, ple)
}

#[tokio::test]
async fn resolve_mixes_local_and_forwarded_records() {
    let (plc, broker, _ple) = plc_and_ple().await;
    broker
        .register(user("plc.alice"), plc.admin(), CallOptions::default())
        .await
        .unwrap();

    let mut records = broker
        .resolve(
            vec![Hrn::new("plc.alice"), Hrn::new("ple.bob")],
            plc.admin(),
            None,
            false,
            CallOptions::default(),
        )
        .await
        .unwrap();
    records.sort_by(|a, b| a.hrn.cmp(&b.hrn));

    let summary: Vec<_> = records
        .iter()
        .map(|r| (r.hrn.as_str(), r.authoritative))
        .collect();
    assert_eq!(summary, vec![("plc.alice", true), ("ple.bob", false)]);
}

#[tokio::test]
async fn unreachable_peer_fails_the_resolve() {
    let plc = Site::new("plc");
    let broker = plc
        .broker()
        .with_peer(Hrn::new("ple"), Arc::new(DeadRegistry::default()));
    broker
        .register(user("plc.alice"), plc.admin(), CallOptions::default())
        .await
        .unwrap();

    // the peer's records are not reported as missing, nor is a partial
    // answer passed off as complete
    let err = broker
        .resolve(
            vec![Hrn::new("plc.alice"), Hrn::new("ple.bob")],
            plc.admin(),
            None,
            false,
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)));

    let err = broker
        .resolve(vec![Hrn::new("ple.bob")], plc.admin(), None, false, CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)));

    // names that stay local are unaffected
    let records = broker
        .resolve(vec![Hrn::new("plc.alice")], plc.admin(), None, false, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn full_resolve_adds_driver_detail_and_authority_url() {
    let plc = Site::new("plc");
    let broker = plc.broker().with_driver(Arc::new(RecordingDriver::default()));
    let authority = Record::builder()
        .hrn(Hrn::new("plc"))
        .kind(RecordType::Authority)
        .build();
    broker
        .register(authority, plc.admin(), CallOptions::default())
        .await
        .unwrap();

    let records = broker
        .resolve(
            vec![Hrn::new("plc")],
            plc.admin(),
            Some(RecordType::Authority),
            true,
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url.as_deref(), Some("quic://127.0.0.1:12345"));
    assert_eq!(records[0].testbed_info[0].value, "mock");
    assert_eq!(records[0].pointer.as_deref(), Some("ptr-plc"));
}

#[tokio::test]
async fn list_is_forwarded_to_the_owning_registry() {
    let (plc, broker, _ple) = plc_and_ple().await;
    let over_ple = vec![credential(&plc.identity, "plc.alice", "ple", &["resolve"])];

    let records = broker
        .list(Hrn::new("ple"), over_ple, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].hrn, Hrn::new("ple.bob"));
    assert!(!records[0].authoritative);

    let over_nowhere = vec![credential(&plc.identity, "plc.alice", "zzz", &["resolve"])];
    let err = broker
        .list(Hrn::new("zzz"), over_nowhere, CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MissingAuthority(_)));
}

#[tokio::test]
async fn remove_succeeds_when_peers_and_driver_fail() {
    let plc = Site::new("plc");
    let dead = Arc::new(DeadRegistry::default());
    let driver = Arc::new(RecordingDriver {
        fail_remove: true,
        ..RecordingDriver::default()
    });
    let broker = plc
        .broker()
        .with_peer(Hrn::new("ple"), dead.clone())
        .with_driver(driver.clone());
    broker
        .register(user("plc.carol"), plc.admin(), CallOptions::default())
        .await
        .unwrap();

    let removed = broker
        .remove("plc.carol", None, plc.admin(), CallOptions::default())
        .await
        .unwrap();
    assert!(removed);
    assert_eq!(dead.removes.load(Ordering::SeqCst), 1);
    assert_eq!(driver.removed.load(Ordering::SeqCst), 1);
    assert!(plc.store.is_empty());
}

#[tokio::test]
async fn researchers_are_reconciled_with_the_driver() {
    let plc = Site::new("plc");
    let driver = Arc::new(RecordingDriver::default());
    let broker = plc.broker().with_driver(driver.clone());
    let creds = plc.admin();
    for name in ["plc.alice", "plc.bob"] {
        broker
            .register(user(name), creds.clone(), CallOptions::default())
            .await
            .unwrap();
    }

    let slice = |researchers: &[&str]| {
        Record::builder()
            .hrn(Hrn::new("plc.exp"))
            .kind(RecordType::Slice)
            .researchers(researchers.iter().map(|r| Hrn::new(*r)).collect())
            .build()
    };
    broker
        .register(slice(&["plc.alice", "plc.ghost"]), creds.clone(), CallOptions::default())
        .await
        .unwrap();
    let stored = plc.store.get(&Hrn::new("plc.exp"), RecordType::Slice).unwrap();
    assert_eq!(stored.researchers, vec![Hrn::new("plc.alice")]);

    broker
        .update(slice(&["plc.bob"]), creds, CallOptions::default())
        .await
        .unwrap();
    let stored = plc.store.get(&Hrn::new("plc.exp"), RecordType::Slice).unwrap();
    assert_eq!(stored.researchers, vec![Hrn::new("plc.bob")]);

    let changes = driver.changes.lock().clone();
    assert_eq!(
        changes,
        vec![
            RelationChange {
                subject: Hrn::new("plc.exp"),
                relation: Relation::Researcher,
                added: vec![Hrn::new("plc.alice")],
                removed: vec![],
            },
            RelationChange {
                subject: Hrn::new("plc.exp"),
                relation: Relation::Researcher,
                added: vec![Hrn::new("plc.bob")],
                removed: vec![Hrn::new("plc.alice")],
            },
        ]
    );
}

#[tokio::test]
async fn authority_gets_full_rights_over_its_users() {
    let plc = Site::new("plc");
    let broker = plc.broker();
    broker
        .register(user("plc.alice"), plc.admin(), CallOptions::default())
        .await
        .unwrap();

    let cred = broker
        .get_credential("plc.alice", "user", Requester::Credentials(plc.admin()))
        .await
        .unwrap();
    assert_eq!(cred.caller(), &Hrn::new("plc"));
    assert_eq!(cred.object(), &Hrn::new("plc.alice"));
    assert!(cred.body.rights.iter().any(|r| r == "authority"));
    assert!(plc.identity.verify(&cred).is_ok());
}

#[tokio::test]
async fn credential_requests_are_refused_for_strangers_and_disabled_accounts() {
    let plc = Site::new("plc");
    let broker = plc.broker();
    broker
        .register(user("plc.alice"), plc.admin(), CallOptions::default())
        .await
        .unwrap();
    let disabled = Record::builder()
        .hrn(Hrn::new("plc.mallory"))
        .kind(RecordType::User)
        .enabled(false)
        .build();
    broker
        .register(disabled, plc.admin(), CallOptions::default())
        .await
        .unwrap();

    let eve = vec![credential(&plc.identity, "ple.eve", "plc", &["resolve"])];
    let err = broker
        .get_credential("plc.alice", "user", Requester::Credentials(eve))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PermissionError(_)));

    let err = broker
        .get_credential("plc.mallory", "user", Requester::Credentials(plc.admin()))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::AccountNotEnabled(_)));

    let err = broker
        .get_credential("plc.alice", "gadget", Requester::Credentials(plc.admin()))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownSfaType(_)));
}
