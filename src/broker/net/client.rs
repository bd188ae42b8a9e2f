use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    link::Link,
    wire::{ControlVerb, Request, Response},
};
use crate::broker::{
    error::BrokerError,
    hrn::{Hrn, RecordType},
    identity::{Challenge, SignedCredential},
    peer::{AggregateClient, CallOptions, RegistryClient, SliceUser, SliverStatus, VersionInfo},
    record::Record,
    registry::Requester,
    rspec::Rspec,
    topology::InterfaceDescriptor,
};

/// Lazily connected link to one peer, re-dialled when the connection drops.
pub struct PeerConnection {
    endpoint: quinn::Endpoint,
    addr: SocketAddr,
    server_name: String,
    link: Mutex<Option<Link>>,
}

impl PeerConnection {
    pub fn new(endpoint: quinn::Endpoint, peer: &InterfaceDescriptor) -> Self {
        Self {
            endpoint,
            addr: peer.addr,
            server_name: peer.server_name.clone(),
            link: Mutex::new(None),
        }
    }

    async fn link(&self) -> Result<Link, BrokerError> {
        let mut slot = self.link.lock().await;
        if let Some(link) = slot.as_ref().filter(|link| !link.is_closed()) {
            return Ok(link.clone());
        }
        debug!(remote = %self.addr, "dialling peer");
        let link = Link::connect(&self.endpoint, self.addr, &self.server_name).await?;
        *slot = Some(link.clone());
        Ok(link)
    }

    /// Makes one call. A [`Response::Failure`] is turned back into the
    /// error the peer raised.
    pub async fn call(&self, request: Request) -> Result<Response, BrokerError> {
        let link = self.link().await?;
        match link.call(&request).await? {
            Response::Failure { kind, detail } => Err(BrokerError::from_wire(kind, detail)),
            response => Ok(response),
        }
    }
}

fn unexpected(verb: &str) -> BrokerError {
    BrokerError::Transport(format!("unexpected response to {}", verb))
}

pub struct QuicRegistryClient(PeerConnection);

impl QuicRegistryClient {
    pub fn new(endpoint: quinn::Endpoint, peer: &InterfaceDescriptor) -> Self {
        Self(PeerConnection::new(endpoint, peer))
    }

    /// Creates a record at the peer and returns its gid.
    pub async fn register(
        &self,
        record: Record,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<String, BrokerError> {
        let request = Request::Register {
            record,
            creds,
            opts,
        };
        match self.0.call(request).await? {
            Response::Gid(gid) => Ok(gid),
            _ => Err(unexpected("Register")),
        }
    }

    pub async fn get_challenge(&self, xrn: &str) -> Result<Challenge, BrokerError> {
        let request = Request::GetChallenge { xrn: xrn.to_string() };
        match self.0.call(request).await? {
            Response::Challenge(challenge) => Ok(challenge),
            _ => Err(unexpected("GetChallenge")),
        }
    }

    pub async fn get_credential(
        &self,
        xrn: &str,
        kind: &str,
        requester: Requester,
    ) -> Result<SignedCredential, BrokerError> {
        let request = Request::GetCredential {
            xrn: xrn.to_string(),
            kind: kind.to_string(),
            requester,
        };
        match self.0.call(request).await? {
            Response::Credential(cred) => Ok(cred),
            _ => Err(unexpected("GetCredential")),
        }
    }
}

#[async_trait]
impl RegistryClient for QuicRegistryClient {
    async fn get_version(&self) -> Result<VersionInfo, BrokerError> {
        match self.0.call(Request::GetRegistryVersion).await? {
            Response::Version(version) => Ok(version),
            _ => Err(unexpected("GetRegistryVersion")),
        }
    }

    async fn resolve(
        &self,
        names: Vec<Hrn>,
        creds: Vec<SignedCredential>,
        kind: Option<RecordType>,
        full: bool,
        opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError> {
        let request = Request::Resolve {
            names,
            creds,
            kind,
            full,
            opts,
        };
        match self.0.call(request).await? {
            Response::Records(records) => Ok(records),
            _ => Err(unexpected("Resolve")),
        }
    }

    async fn list(
        &self,
        container: Hrn,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Vec<Record>, BrokerError> {
        let request = Request::List {
            container,
            creds,
            opts,
        };
        match self.0.call(request).await? {
            Response::Records(records) => Ok(records),
            _ => Err(unexpected("List")),
        }
    }

    async fn remove(
        &self,
        hrn: Hrn,
        kind: Option<RecordType>,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        let request = Request::Remove {
            xrn: hrn.to_string(),
            kind: kind.map(|kind| kind.to_string()),
            creds,
            opts,
        };
        match self.0.call(request).await? {
            Response::Flag(ok) => Ok(ok),
            _ => Err(unexpected("Remove")),
        }
    }
}

/// Client for a peer slice broker or aggregate. Federated answers from the
/// peer are collapsed to their merged value.
pub struct QuicAggregateClient(PeerConnection);

impl QuicAggregateClient {
    pub fn new(endpoint: quinn::Endpoint, peer: &InterfaceDescriptor) -> Self {
        Self(PeerConnection::new(endpoint, peer))
    }

    async fn control(
        &self,
        verb: ControlVerb,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        let request = Request::Control {
            verb,
            slice_urn,
            creds,
            opts,
        };
        let name = request.verb();
        match self.0.call(request).await? {
            Response::Outcome { ok, .. } => Ok(ok),
            _ => Err(unexpected(name)),
        }
    }
}

#[async_trait]
impl AggregateClient for QuicAggregateClient {
    async fn get_version(&self) -> Result<VersionInfo, BrokerError> {
        match self.0.call(Request::GetVersion).await? {
            Response::Version(version) => Ok(version),
            _ => Err(unexpected("GetVersion")),
        }
    }

    async fn list_resources(
        &self,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Rspec, BrokerError> {
        match self.0.call(Request::ListResources { creds, opts }).await? {
            Response::Resources { rspec, .. } => Ok(rspec),
            _ => Err(unexpected("ListResources")),
        }
    }

    async fn create_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    ) -> Result<Rspec, BrokerError> {
        let request = Request::CreateSliver {
            slice_urn,
            creds,
            rspec,
            users,
            opts,
        };
        match self.0.call(request).await? {
            Response::Resources { rspec, .. } => Ok(rspec),
            _ => Err(unexpected("CreateSliver")),
        }
    }

    async fn delete_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.control(ControlVerb::DeleteSliver, slice_urn, creds, opts)
            .await
    }

    async fn renew_sliver(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        expiration: DateTime<Utc>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        let request = Request::RenewSliver {
            slice_urn,
            creds,
            expires: expiration.timestamp(),
            opts,
        };
        match self.0.call(request).await? {
            Response::Outcome { ok, .. } => Ok(ok),
            _ => Err(unexpected("RenewSliver")),
        }
    }

    async fn sliver_status(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<SliverStatus, BrokerError> {
        let request = Request::SliverStatus {
            slice_urn,
            creds,
            opts,
        };
        match self.0.call(request).await? {
            Response::Status { status, .. } => Ok(status),
            _ => Err(unexpected("SliverStatus")),
        }
    }

    async fn list_slices(
        &self,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<Vec<String>, BrokerError> {
        match self.0.call(Request::ListSlices { creds, opts }).await? {
            Response::Slices { urns, .. } => Ok(urns),
            _ => Err(unexpected("ListSlices")),
        }
    }

    async fn get_ticket(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        rspec: Rspec,
        users: Vec<SliceUser>,
        opts: CallOptions,
    ) -> Result<Rspec, BrokerError> {
        let request = Request::GetTicket {
            slice_urn,
            creds,
            rspec,
            users,
            opts,
        };
        match self.0.call(request).await? {
            Response::Resources { rspec, .. } => Ok(rspec),
            _ => Err(unexpected("GetTicket")),
        }
    }

    async fn start_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.control(ControlVerb::StartSlice, slice_urn, creds, opts)
            .await
    }

    async fn stop_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.control(ControlVerb::StopSlice, slice_urn, creds, opts)
            .await
    }

    async fn reset_slice(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.control(ControlVerb::ResetSlice, slice_urn, creds, opts)
            .await
    }

    async fn shutdown(
        &self,
        slice_urn: String,
        creds: Vec<SignedCredential>,
        opts: CallOptions,
    ) -> Result<bool, BrokerError> {
        self.control(ControlVerb::Shutdown, slice_urn, creds, opts)
            .await
    }
}
