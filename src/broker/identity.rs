// Credentials are signed rights tokens. A credential says that `caller` may
// exercise `rights` over `object` (and everything below it in the HRN tree)
// until `expires`, and is only believed when its signature verifies against
// the public key of a trusted `issuer`.
//
// The brokers consume this module through a handful of verbs: authorize a
// presented credential for an operation, mint a new one, pick a credential
// delegated to us, and compute rights for a caller over a record. Signing is
// done with KT2 over the canonical rkyv encoding of the credential body.
//
// The broker's secret key and the credential handed to operators live in
// files, both as rkyv bytes.

use std::{
    fmt,
    fs,
    io::{self, Write},
    path::Path,
};

use blake3::hash;
use chrono::{Duration, Utc};
use hashbrown::HashMap;
use kt2::{Keypair, PublicKey, SecretKey, Signature};
use parking_lot::{Mutex, RwLock};
use rkyv::{from_bytes, to_bytes, Archive, Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use super::{
    error::BrokerError,
    hex::HexDisplayExt,
    hrn::{Hrn, RecordType},
    peer::VersionInfo,
    record::Record,
};

/// Right that grants every privilege.
pub const ALL_RIGHTS: &str = "*";

/// Lifetime of credentials minted for objects that carry no expiration.
pub const DEFAULT_CREDENTIAL_DAYS: i64 = 30;

/// Every operation a broker exposes. Authorization is checked per operation.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    GetVersion,
    Resolve,
    List,
    Register,
    Update,
    Remove,
    GetCredential,
    ListResources,
    CreateSliver,
    DeleteSliver,
    RenewSliver,
    SliverStatus,
    ListSlices,
    GetTicket,
    StartSlice,
    StopSlice,
    ResetSlice,
    Shutdown,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::GetVersion => "GetVersion",
            Operation::Resolve => "Resolve",
            Operation::List => "List",
            Operation::Register => "Register",
            Operation::Update => "Update",
            Operation::Remove => "Remove",
            Operation::GetCredential => "GetCredential",
            Operation::ListResources => "ListResources",
            Operation::CreateSliver => "CreateSliver",
            Operation::DeleteSliver => "DeleteSliver",
            Operation::RenewSliver => "RenewSliver",
            Operation::SliverStatus => "SliverStatus",
            Operation::ListSlices => "ListSlices",
            Operation::GetTicket => "GetTicket",
            Operation::StartSlice => "StartSlice",
            Operation::StopSlice => "StopSlice",
            Operation::ResetSlice => "ResetSlice",
            Operation::Shutdown => "Shutdown",
        }
    }

    /// The privilege a credential's rights must grant.
    pub fn privilege(&self) -> &'static str {
        match self {
            Operation::GetVersion => "getversion",
            Operation::Resolve => "resolve",
            Operation::List => "list",
            Operation::Register => "register",
            Operation::Update => "update",
            Operation::Remove => "remove",
            Operation::GetCredential => "getcredential",
            Operation::ListResources => "listresources",
            Operation::CreateSliver => "createsliver",
            Operation::DeleteSliver => "deletesliver",
            Operation::RenewSliver => "renewsliver",
            Operation::SliverStatus => "sliverstatus",
            Operation::ListSlices => "listslices",
            Operation::GetTicket => "getticket",
            Operation::StartSlice => "startslice",
            Operation::StopSlice => "stopslice",
            Operation::ResetSlice => "resetslice",
            Operation::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PRIVILEGES: &[(&str, &[&str])] = &[
    ("refresh", &["remove", "update"]),
    ("resolve", &["resolve", "list", "getversion", "getcredential"]),
    (
        "info",
        &["listresources", "sliverstatus", "listslices", "resolve", "list", "getversion"],
    ),
    (
        "embed",
        &["createsliver", "deletesliver", "renewsliver", "getticket", "listresources", "sliverstatus"],
    ),
    ("bind", &["getticket", "createsliver"]),
    (
        "control",
        &["startslice", "stopslice", "resetslice", "shutdown", "sliverstatus", "deletesliver"],
    ),
    (
        "authority",
        &["register", "remove", "update", "resolve", "list", "getcredential"],
    ),
    ("pi", &["register", "remove", "update", "listslices"]),
];

/// Returns true if any of `rights` grants `privilege`.
pub fn rights_grant(rights: &[String], privilege: &str) -> bool {
    rights.iter().any(|right| {
        right == ALL_RIGHTS
            || PRIVILEGES
                .iter()
                .any(|(name, grants)| *name == right.as_str() && grants.contains(&privilege))
    })
}

/// The signed part of a credential.
#[derive(Archive, Serialize, Deserialize, TypedBuilder, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct CredentialBody {
    /// Identity asserting the rights (gid-caller).
    pub caller: Hrn,
    /// Object the rights apply to (gid-object).
    pub object: Hrn,
    pub object_kind: RecordType,
    /// Authority whose key signs this credential.
    pub issuer: Hrn,
    pub rights: Vec<String>,
    /// Whether the holder may delegate the credential onwards.
    #[builder(default)]
    pub delegate: bool,
    /// Unix seconds.
    pub expires: i64,
    #[builder(default = rand::random())]
    pub serial: u64,
}

impl CredentialBody {
    fn canonical_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        to_bytes::<_, 1024>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| BrokerError::Encoding(format!("credential body: {:?}", e)))
    }
}

/// A credential as presented over the wire.
#[derive(Archive, Serialize, Deserialize, Clone)]
#[archive(check_bytes)]
pub struct SignedCredential {
    pub body: CredentialBody,
    pub signature: Signature,
}

impl SignedCredential {
    pub fn caller(&self) -> &Hrn {
        &self.body.caller
    }

    pub fn object(&self) -> &Hrn {
        &self.body.object
    }

    pub fn is_expired(&self) -> bool {
        self.body.expires < Utc::now().timestamp()
    }
}

impl fmt::Debug for SignedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedCredential")
            .field("body", &self.body)
            .field("signature", &self.signature.0.short_hex())
            .finish()
    }
}

/// Decides what a caller may do to a record.
pub trait RightsPolicy: Send + Sync {
    fn determine_rights(&self, caller: &Hrn, object: &Record) -> Vec<String>;
}

/// Rights derived from the naming hierarchy and membership lists:
/// an object owns itself, an authority owns everything below it, slice
/// researchers operate the slice, PIs administer their authority.
#[derive(Default, Clone, Copy, Debug)]
pub struct HierarchyRights;

impl RightsPolicy for HierarchyRights {
    fn determine_rights(&self, caller: &Hrn, object: &Record) -> Vec<String> {
        let mut rights: Vec<&str> = Vec::new();
        if caller == &object.hrn {
            rights.extend(["refresh", "resolve", "info"]);
            if object.kind == RecordType::Authority {
                rights.push("authority");
            }
        }
        if caller.is_ancestor_of(&object.hrn) {
            rights.extend(["authority", "refresh", "resolve", "info", "embed", "bind", "control", "pi"]);
        }
        if object.kind == RecordType::Slice && object.researchers.contains(caller) {
            rights.extend(["refresh", "embed", "bind", "control", "info"]);
        }
        if object.kind == RecordType::Authority && object.pis.contains(caller) {
            rights.extend(["authority", "pi", "refresh", "resolve", "info"]);
        }
        let mut rights: Vec<String> = rights.into_iter().map(String::from).collect();
        rights.sort();
        rights.dedup();
        rights
    }
}

/// Signing identity of this broker plus the set of issuers and hosted
/// authorities it knows about.
pub struct IdentityService {
    hrn: Hrn,
    key: SecretKey,
    public_key: PublicKey,
    trusted: RwLock<HashMap<Hrn, PublicKey>>,
    /// Authorities hosted here, with their root identity material.
    hierarchy: RwLock<HashMap<Hrn, String>>,
}

impl IdentityService {
    pub fn new(hrn: Hrn, keypair: Keypair) -> Self {
        let Keypair { public, secret } = keypair;
        let mut trusted = HashMap::new();
        trusted.insert(hrn.clone(), public.clone());
        let mut hierarchy = HashMap::new();
        hierarchy.insert(hrn.clone(), gid_for(&hrn, &public.bytes));
        Self {
            hrn,
            key: secret,
            public_key: public,
            trusted: RwLock::new(trusted),
            hierarchy: RwLock::new(hierarchy),
        }
    }

    /// Creates a service with a freshly generated keypair.
    pub fn generate(hrn: Hrn) -> Self {
        Self::new(hrn, Keypair::generate(None))
    }

    /// Loads the secret key stored at `path`. When the file does not exist
    /// yet a keypair is generated and its secret half written there, so a
    /// restarted broker keeps signing with the same key.
    pub fn load_or_create(hrn: Hrn, path: &Path) -> Result<Self, BrokerError> {
        let unreadable = |e: String| BrokerError::Config(format!("{}: {}", path.display(), e));
        match fs::read(path) {
            Ok(bytes) => {
                let secret = from_bytes::<SecretKey>(&bytes)
                    .map_err(|_| unreadable("not a signing key".into()))?;
                let public = PublicKey::from_sk(&secret);
                debug!(hrn = %hrn, path = %path.display(), "loaded signing key");
                Ok(Self::new(hrn, Keypair { public, secret }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let keypair = Keypair::generate(None);
                let bytes = to_bytes::<_, 4096>(&keypair.secret)
                    .map_err(|e| BrokerError::Encoding(format!("secret key: {:?}", e)))?;
                write_private(path, &bytes).map_err(|e| unreadable(e.to_string()))?;
                debug!(hrn = %hrn, path = %path.display(), "generated signing key");
                Ok(Self::new(hrn, keypair))
            }
            Err(e) => Err(unreadable(e.to_string())),
        }
    }

    pub fn hrn(&self) -> &Hrn {
        &self.hrn
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Accepts credentials signed by `issuer` from now on.
    pub fn trust(&self, issuer: Hrn, key: PublicKey) {
        debug!(issuer = %issuer, "trusting issuer");
        self.trusted.write().insert(issuer, key);
    }

    /// Our public key in the form peers pass to [`IdentityService::trust_encoded`].
    pub fn encoded_public_key(&self) -> Result<Vec<u8>, BrokerError> {
        encode_public_key(&self.public_key)
    }

    pub fn trust_encoded(&self, issuer: Hrn, encoded: &[u8]) -> Result<(), BrokerError> {
        let key = from_bytes::<PublicKey>(encoded)
            .map_err(|_| BrokerError::Encoding(format!("bad public key for {}", issuer)))?;
        self.trust(issuer, key);
        Ok(())
    }

    /// Trusts the signing key `peer` advertised in its GetVersion answer. The
    /// answer must name the peer we asked.
    pub fn trust_version(&self, peer: &Hrn, version: &VersionInfo) -> Result<(), BrokerError> {
        if &version.hrn != peer {
            return Err(BrokerError::Unauthorized(format!(
                "peer {} answered as {}",
                peer, version.hrn
            )));
        }
        if version.signing_key.is_empty() {
            return Err(BrokerError::Encoding(format!(
                "{} advertised no signing key",
                version.hrn
            )));
        }
        self.trust_encoded(version.hrn.clone(), &version.signing_key)
    }

    pub fn knows_authority(&self, hrn: &Hrn) -> bool {
        self.hierarchy.read().contains_key(hrn)
    }

    /// Adds `hrn` to the hosted hierarchy and returns its root identity
    /// material. Idempotent.
    pub fn create_authority(&self, hrn: &Hrn) -> String {
        if let Some(gid) = self.hierarchy.read().get(hrn) {
            return gid.clone();
        }
        let Keypair { public, .. } = Keypair::generate(None);
        let gid = gid_for(hrn, &public.bytes);
        debug!(authority = %hrn, "created authority");
        self.hierarchy
            .write()
            .entry(hrn.clone())
            .or_insert(gid)
            .clone()
    }

    /// Identity material for a non-authority object, bound to its primary
    /// key when it has one. Anyone can recompute it, so it names an object
    /// but never proves who is asking.
    pub fn create_gid(&self, hrn: &Hrn, key: Option<&str>) -> String {
        let mut material = hrn.as_str().as_bytes().to_vec();
        if let Some(key) = key {
            material.extend_from_slice(key.as_bytes());
        }
        gid_for(hrn, &material)
    }

    /// Signs `body` with this service's key.
    pub fn mint(&self, body: CredentialBody) -> Result<SignedCredential, BrokerError> {
        let bytes = body.canonical_bytes()?;
        let signature = self.key.sign(&bytes);
        trace!(caller = %body.caller, object = %body.object, "minted credential");
        Ok(SignedCredential { body, signature })
    }

    /// Signs a challenge with this service's key.
    pub fn sign_challenge(&self, challenge: Challenge) -> ChallengeProof {
        ChallengeProof {
            challenge,
            signature: self.key.sign(&challenge.0),
        }
    }

    /// A credential naming this broker as caller with every right over its
    /// own subtree. Used when forwarding on our own behalf.
    pub fn own_credential(&self) -> Result<SignedCredential, BrokerError> {
        let body = CredentialBody::builder()
            .caller(self.hrn.clone())
            .object(self.hrn.clone())
            .object_kind(RecordType::Authority)
            .issuer(self.hrn.clone())
            .rights(vec![ALL_RIGHTS.to_string()])
            .delegate(true)
            .expires((Utc::now() + Duration::days(DEFAULT_CREDENTIAL_DAYS)).timestamp())
            .build();
        self.mint(body)
    }

    /// Mints a fresh [`IdentityService::own_credential`] and writes it to
    /// `path`, replacing what was there. Whoever can read the file holds
    /// every right over this broker's subtree.
    pub fn export_own_credential(&self, path: &Path) -> Result<SignedCredential, BrokerError> {
        let cred = self.own_credential()?;
        let bytes = to_bytes::<_, 1024>(&cred)
            .map_err(|e| BrokerError::Encoding(format!("credential: {:?}", e)))?;
        if path.exists() {
            fs::remove_file(path)
                .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        }
        write_private(path, &bytes)
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(cred)
    }

    /// Checks the signature against a trusted issuer and the expiration.
    pub fn verify(&self, cred: &SignedCredential) -> Result<(), BrokerError> {
        let bytes = cred.body.canonical_bytes()?;
        let trusted = self.trusted.read();
        let key = trusted.get(&cred.body.issuer).ok_or_else(|| {
            BrokerError::Unauthorized(format!("untrusted issuer {}", cred.body.issuer))
        })?;
        if !key.verify(&bytes, &cred.signature) {
            return Err(BrokerError::Unauthorized(format!(
                "bad signature on credential for {}",
                cred.body.caller
            )));
        }
        if cred.is_expired() {
            return Err(BrokerError::CredentialExpired(cred.body.caller.to_string()));
        }
        Ok(())
    }

    /// Verifies `cred` and checks it grants `op` over `target` (when the
    /// operation has a single target).
    pub fn authorize(
        &self,
        cred: &SignedCredential,
        op: Operation,
        target: Option<&Hrn>,
    ) -> Result<(), BrokerError> {
        self.verify(cred)?;
        if !rights_grant(&cred.body.rights, op.privilege()) {
            return Err(BrokerError::Unauthorized(format!(
                "{} may not {}",
                cred.body.caller, op
            )));
        }
        if let Some(target) = target {
            if !cred.body.object.covers(target) {
                return Err(BrokerError::Unauthorized(format!(
                    "credential for {} does not cover {}",
                    cred.body.object, target
                )));
            }
        }
        Ok(())
    }

    /// The first credential that authorizes `op`. When none does, the error
    /// from the last candidate is returned.
    pub fn first_authorized<'a>(
        &self,
        creds: &'a [SignedCredential],
        op: Operation,
        target: Option<&Hrn>,
    ) -> Result<&'a SignedCredential, BrokerError> {
        let mut last_err = BrokerError::Unauthorized(format!("no credential presented for {}", op));
        for cred in creds {
            match self.authorize(cred, op, target) {
                Ok(()) => return Ok(cred),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// A credential that some hosted authority delegated to us, recognized by
    /// its caller being an authority in our hierarchy.
    pub fn delegated<'a>(&self, creds: &'a [SignedCredential]) -> Option<&'a SignedCredential> {
        creds
            .iter()
            .find(|cred| self.knows_authority(cred.caller()) && self.verify(cred).is_ok())
    }
}

/// Reads a credential written by [`IdentityService::export_own_credential`].
pub fn load_credential(path: &Path) -> Result<SignedCredential, BrokerError> {
    let bytes =
        fs::read(path).map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
    from_bytes::<SignedCredential>(&bytes)
        .map_err(|_| BrokerError::Encoding(format!("{}: not a credential", path.display())))
}

/// Creates `path` readable by its owner only. Fails if it already exists.
fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    options.open(path)?.write_all(bytes)
}

/// How long an issued challenge can be redeemed.
pub const CHALLENGE_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// Random nonce a holder signs to prove it owns a key.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct Challenge(pub [u8; 32]);

impl Challenge {
    pub fn new() -> Self {
        Self(rand::random())
    }
}

impl Default for Challenge {
    fn default() -> Self {
        Self::new()
    }
}

/// A challenge together with the holder's signature over it.
#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
pub struct ChallengeProof {
    pub challenge: Challenge,
    pub signature: Signature,
}

/// Encodes a public key the way records and version answers carry it.
pub fn encode_public_key(key: &PublicKey) -> Result<Vec<u8>, BrokerError> {
    to_bytes::<_, 1024>(key)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| BrokerError::Encoding(format!("public key: {:?}", e)))
}

pub fn decode_public_key(encoded: &[u8]) -> Result<PublicKey, BrokerError> {
    from_bytes::<PublicKey>(encoded).map_err(|_| BrokerError::Encoding("bad public key".into()))
}

/// Checks `proof` against the encoded public key of its holder.
pub fn verify_proof(encoded: &[u8], proof: &ChallengeProof) -> Result<(), BrokerError> {
    let key = decode_public_key(encoded)?;
    if !key.verify(&proof.challenge.0, &proof.signature) {
        return Err(BrokerError::Unauthorized("challenge signature does not verify".into()));
    }
    Ok(())
}

/// Challenges handed out and not yet redeemed. Each one is bound to the
/// subject it was issued for and can be redeemed once.
pub struct ChallengeBook {
    ttl: std::time::Duration,
    pending: Mutex<HashMap<Challenge, (Hrn, Instant)>>,
}

impl ChallengeBook {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, subject: Hrn) -> Challenge {
        let challenge = Challenge::new();
        let mut pending = self.pending.lock();
        let ttl = self.ttl;
        pending.retain(|_, (_, issued)| issued.elapsed() < ttl);
        trace!(subject = %subject, outstanding = pending.len(), "issued challenge");
        pending.insert(challenge, (subject, Instant::now()));
        challenge
    }

    /// Consumes `challenge`. Fails when it was never issued, was issued for
    /// another subject, was already redeemed or has expired.
    pub fn redeem(&self, challenge: &Challenge, subject: &Hrn) -> Result<(), BrokerError> {
        let unknown = || BrokerError::Unauthorized(format!("no outstanding challenge for {}", subject));
        let (issued_for, issued) = self.pending.lock().remove(challenge).ok_or_else(unknown)?;
        if &issued_for != subject || issued.elapsed() >= self.ttl {
            return Err(unknown());
        }
        Ok(())
    }
}

impl Default for ChallengeBook {
    fn default() -> Self {
        Self::new(CHALLENGE_TTL)
    }
}

fn gid_for(hrn: &Hrn, material: &[u8]) -> String {
    format!("gid:{}:{}", hrn, hash(material).as_bytes().hex())
}
