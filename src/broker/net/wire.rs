use byteorder::{ByteOrder, LittleEndian};
use rkyv::{
    bytecheck::CheckBytes, de::deserializers::SharedDeserializeMap, from_bytes,
    ser::serializers::AllocSerializer, to_bytes, validation::validators::DefaultValidator,
    AlignedVec, Archive, Deserialize, Serialize,
};

use super::error::TransportError::{self, *};
use crate::broker::{
    error::ErrorKind,
    fanout::AggregateDiagnostic,
    hrn::{Hrn, RecordType},
    identity::{Challenge, SignedCredential},
    peer::{CallOptions, SliceUser, SliverStatus, VersionInfo},
    record::Record,
    registry::Requester,
    rspec::Rspec,
};

/// Length prefix in front of every frame.
pub const HEADER_LEN: usize = 4;

/// Upper bound on a frame body, compressed or not.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

const SCRATCH: usize = 4096;

/// Per-slice verbs that answer with a single boolean.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum ControlVerb {
    DeleteSliver,
    StartSlice,
    StopSlice,
    ResetSlice,
    Shutdown,
}

/// One call, as sent by a client. Registry and aggregate verbs share a
/// single endpoint.
#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
pub enum Request {
    GetRegistryVersion,
    Resolve {
        names: Vec<Hrn>,
        creds: Vec<SignedCredential>,
        kind: Option<RecordType>,
        full: bool,
        opts: CallOptions,
    },
    List {
        container: Hrn,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    },
    Register {
        record: Record,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    },
    Update {
        record: Record,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    },
    Remove {
        xrn: String,
        kind: Option<String>,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    },
    GetChallenge {
        xrn: String,
    },
    GetCredential {
        xrn: String,
        kind: String,
        requester: Requester,
    },
    GetVersion,
    ListResources {
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    },
    CreateSliver {
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    },
    GetTicket {
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    },
    RenewSliver {
        slice_urn: String,
        creds: Vec<SignedCredential>,
        /// Unix seconds.
        expires: i64,
        opts: CallOptions,
    },
    SliverStatus {
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    },
    ListSlices {
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    },
    Control {
        verb: ControlVerb,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    },
}

impl Request {
    pub fn verb(&self) -> &'static str {
        match self {
            Request::GetRegistryVersion => "GetRegistryVersion",
            Request::Resolve { .. } => "Resolve",
            Request::List { .. } => "List",
            Request::Register { .. } => "Register",
            Request::Update { .. } => "Update",
            Request::Remove { .. } => "Remove",
            Request::GetChallenge { .. } => "GetChallenge",
            Request::GetCredential { .. } => "GetCredential",
            Request::GetVersion => "GetVersion",
            Request::ListResources { .. } => "ListResources",
            Request::CreateSliver { .. } => "CreateSliver",
            Request::GetTicket { .. } => "GetTicket",
            Request::RenewSliver { .. } => "RenewSliver",
            Request::SliverStatus { .. } => "SliverStatus",
            Request::ListSlices { .. } => "ListSlices",
            Request::Control { verb, .. } => match verb {
                ControlVerb::DeleteSliver => "DeleteSliver",
                ControlVerb::StartSlice => "StartSlice",
                ControlVerb::StopSlice => "StopSlice",
                ControlVerb::ResetSlice => "ResetSlice",
                ControlVerb::Shutdown => "Shutdown",
            },
        }
    }
}

/// Answer to a [`Request`]. Federated answers carry the per-aggregate
/// diagnostics next to the merged value.
#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
pub enum Response {
    Version(VersionInfo),
    Records(Vec<Record>),
    Gid(String),
    Flag(bool),
    Credential(SignedCredential),
    Challenge(Challenge),
    Resources {
        rspec: Rspec,
        aggregates: Vec<AggregateDiagnostic>,
    },
    Status {
        status: SliverStatus,
        aggregates: Vec<AggregateDiagnostic>,
    },
    Slices {
        urns: Vec<String>,
        aggregates: Vec<AggregateDiagnostic>,
    },
    Outcome {
        ok: bool,
        aggregates: Vec<AggregateDiagnostic>,
    },
    Failure {
        kind: ErrorKind,
        detail: String,
    },
}

/// Serializes `msg` into `len | zstd(rkyv(msg))`.
pub fn encode_frame<T>(msg: &T) -> Result<Vec<u8>, TransportError>
where
    T: Serialize<AllocSerializer<SCRATCH>>,
{
    let raw = to_bytes::<_, SCRATCH>(msg).map_err(|_| CouldNotEncode(std::any::type_name::<T>()))?;
    let body = zstd::bulk::compress(&raw, ZSTD_LEVEL)?;
    if body.len() > MAX_FRAME {
        return Err(FrameTooLarge(body.len()));
    }
    let mut buf = vec![0u8; HEADER_LEN + body.len()];
    LittleEndian::write_u32(&mut buf[..HEADER_LEN], body.len() as u32);
    buf[HEADER_LEN..].copy_from_slice(&body);
    Ok(buf)
}

/// Inverse of [`encode_frame`]. The whole frame must be present.
pub fn decode_frame<T>(frame: &[u8]) -> Result<T, TransportError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, SharedDeserializeMap>,
{
    if frame.len() < HEADER_LEN {
        return Err(MalformedFrame(format!("{} byte frame", frame.len())));
    }
    let len = LittleEndian::read_u32(&frame[..HEADER_LEN]) as usize;
    if len > MAX_FRAME {
        return Err(FrameTooLarge(len));
    }
    let body = &frame[HEADER_LEN..];
    if body.len() != len {
        return Err(MalformedFrame(format!(
            "header says {} bytes, got {}",
            len,
            body.len()
        )));
    }
    let raw = zstd::bulk::decompress(body, MAX_FRAME)?;
    // archived data must be read from an aligned buffer
    let mut aligned = AlignedVec::with_capacity(raw.len());
    aligned.extend_from_slice(&raw);
    from_bytes::<T>(&aligned)
        .map_err(|_| MalformedFrame(format!("invalid {}", std::any::type_name::<T>())))
}
