use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tracing::{debug, debug_span, Instrument};

use super::wire::{ControlVerb, Request, Response};
use crate::broker::{
    aggregate::{Federated, SliceBroker},
    error::BrokerError,
    registry::RegistryBroker,
};

/// Routes decoded requests to the broker that serves them.
pub struct Dispatcher {
    registry: Arc<RegistryBroker>,
    slices: Arc<SliceBroker>,
}

fn outcome(answer: Federated<bool>) -> Response {
    Response::Outcome {
        ok: answer.value,
        aggregates: answer.aggregates,
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<RegistryBroker>, slices: Arc<SliceBroker>) -> Self {
        Self { registry, slices }
    }

    /// Never fails: errors are turned into [`Response::Failure`] so the
    /// client can rebuild them.
    pub async fn handle(&self, request: Request) -> Response {
        let span = debug_span!("request", verb = request.verb());
        async move {
            match self.route(request).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(error = %err, "request failed");
                    Response::Failure {
                        kind: err.kind(),
                        detail: err.detail().to_string(),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn route(&self, request: Request) -> Result<Response, BrokerError> {
        let registry = &self.registry;
        let slices = &self.slices;
        Ok(match request {
            Request::GetRegistryVersion => Response::Version(registry.get_version()?),
            Request::Resolve {
                names,
                creds,
                kind,
                full,
                opts,
            } => Response::Records(registry.resolve(names, creds, kind, full, opts).await?),
            Request::List {
                container,
                creds,
                opts,
            } => Response::Records(registry.list(container, creds, opts).await?),
            Request::Register {
                record,
                creds,
                opts,
            } => Response::Gid(registry.register(record, creds, opts).await?),
            Request::Update {
                record,
                creds,
                opts,
            } => Response::Flag(registry.update(record, creds, opts).await?),
            Request::Remove {
                xrn,
                kind,
                creds,
                opts,
            } => Response::Flag(registry.remove(&xrn, kind.as_deref(), creds, opts).await?),
            Request::GetChallenge { xrn } => Response::Challenge(registry.get_challenge(&xrn)?),
            Request::GetCredential {
                xrn,
                kind,
                requester,
            } => Response::Credential(registry.get_credential(&xrn, &kind, requester).await?),
            Request::GetVersion => Response::Version(slices.get_version()?),
            Request::ListResources { creds, opts } => {
                let answer = slices.list_resources(creds, opts).await?;
                Response::Resources {
                    rspec: answer.value,
                    aggregates: answer.aggregates,
                }
            }
            Request::CreateSliver {
                slice_urn,
                creds,
                rspec,
                users,
                opts,
            } => {
                let answer = slices
                    .create_sliver(slice_urn, creds, rspec, users, opts)
                    .await?;
                Response::Resources {
                    rspec: answer.value,
                    aggregates: answer.aggregates,
                }
            }
            Request::GetTicket {
                slice_urn,
                creds,
                rspec,
                users,
                opts,
            } => {
                let answer = slices.get_ticket(slice_urn, creds, rspec, users, opts).await?;
                Response::Resources {
                    rspec: answer.value,
                    aggregates: answer.aggregates,
                }
            }
            Request::RenewSliver {
                slice_urn,
                creds,
                expires,
                opts,
            } => {
                let expiration = Utc
                    .timestamp_opt(expires, 0)
                    .single()
                    .ok_or_else(|| BrokerError::Encoding(format!("bad expiration {}", expires)))?;
                outcome(slices.renew_sliver(slice_urn, creds, expiration, opts).await?)
            }
            Request::SliverStatus {
                slice_urn,
                creds,
                opts,
            } => {
                let answer = slices.sliver_status(slice_urn, creds, opts).await?;
                Response::Status {
                    status: answer.value,
                    aggregates: answer.aggregates,
                }
            }
            Request::ListSlices { creds, opts } => {
                let answer = slices.list_slices(creds, opts).await?;
                Response::Slices {
                    urns: answer.value,
                    aggregates: answer.aggregates,
                }
            }
            Request::Control {
                verb,
                slice_urn,
                creds,
                opts,
            } => outcome(match verb {
                ControlVerb::DeleteSliver => slices.delete_sliver(slice_urn, creds, opts).await?,
                ControlVerb::StartSlice => slices.start_slice(slice_urn, creds, opts).await?,
                ControlVerb::StopSlice => slices.stop_slice(slice_urn, creds, opts).await?,
                ControlVerb::ResetSlice => slices.reset_slice(slice_urn, creds, opts).await?,
                ControlVerb::Shutdown => slices.shutdown(slice_urn, creds, opts).await?,
            }),
        })
    }
}
