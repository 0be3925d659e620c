//! HTTP access to remote beacon nodes.
//!
//! The indexer core only depends on the semantic [`BeaconRpc`] contract; the concrete
//! [`BeaconNodeHttpClient`] speaks the standard beacon API over `reqwest`.

use crate::api_types::{
    BlockHeaderData, CommitteeData, DutiesResponse, FinalityCheckpointsData, ForkVersionedResponse,
    GenericResponse, GenesisData, ProposerData, SignedBeaconBlock, SseHead, StateId,
    SyncCommitteeData, ValidatorData,
};
use crate::config::{BeaconApiConfig, EndpointConfig};
use crate::types::{Epoch, Hash256, Slot};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

#[derive(Debug)]
pub enum Error {
    /// An error was raised by the transport layer.
    Reqwest(reqwest::Error),
    /// The supplied URL cannot be parsed or extended.
    InvalidUrl(String),
    /// The server returned a non-success status code.
    ServerMessage { status: u16, message: String },
    /// A referenced root or state is unknown to the remote node.
    NotFound(String),
    /// The server sent an event stream message that cannot be parsed.
    InvalidServerSentEvent(String),
    /// The server returned data that is internally inconsistent.
    InvalidResponse(String),
}

/// Coarse classification used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    NotFound,
    Protocol,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Reqwest(e) if e.is_decode() => ErrorKind::Protocol,
            Error::Reqwest(_) => ErrorKind::Transient,
            Error::InvalidUrl(_) => ErrorKind::Protocol,
            Error::ServerMessage { status, .. } if *status == 404 => ErrorKind::NotFound,
            Error::ServerMessage { status, .. } if *status >= 500 => ErrorKind::Transient,
            Error::ServerMessage { .. } => ErrorKind::Protocol,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidServerSentEvent(_) => ErrorKind::Protocol,
            Error::InvalidResponse(_) => ErrorKind::Protocol,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Reqwest(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidUrl(format!("{:?}", e))
    }
}

/// The semantic calls the indexer makes against a consensus client.
///
/// `stream_head` runs a single subscription until the server closes it or fails; callers are
/// expected to restart it with exponential backoff.
#[async_trait]
pub trait BeaconRpc: Send + Sync {
    async fn proposer_duties(
        &self,
        epoch: Epoch,
    ) -> Result<DutiesResponse<Vec<ProposerData>>, Error>;

    async fn committee_duties(
        &self,
        state_id: &StateId,
        epoch: Epoch,
    ) -> Result<Vec<CommitteeData>, Error>;

    async fn sync_committee(
        &self,
        state_id: &StateId,
        epoch: Epoch,
    ) -> Result<Option<SyncCommitteeData>, Error>;

    async fn state_validators(&self, state_id: &StateId) -> Result<Vec<ValidatorData>, Error>;

    async fn block_header(&self, root: Hash256) -> Result<Option<BlockHeaderData>, Error>;

    async fn block_header_by_slot(&self, slot: Slot) -> Result<Option<BlockHeaderData>, Error>;

    async fn block_body(&self, root: Hash256) -> Result<Option<SignedBeaconBlock>, Error>;

    async fn finality_checkpoints(&self) -> Result<FinalityCheckpointsData, Error>;

    async fn genesis(&self) -> Result<GenesisData, Error>;

    async fn stream_head(&self, tx: UnboundedSender<SseHead>) -> Result<(), Error>;
}

/// Per-call timeouts. Validator-set downloads are far larger than duty queries and get their own
/// budget.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub duties: Duration,
    pub validator_set: Duration,
}

impl Timeouts {
    pub fn set_all(timeout: Duration) -> Self {
        Timeouts {
            duties: timeout,
            validator_set: timeout,
        }
    }
}

pub struct BeaconNodeHttpClient {
    client: reqwest::Client,
    server: Url,
    timeouts: Timeouts,
}

impl BeaconNodeHttpClient {
    pub fn new(server: Url, timeouts: Timeouts) -> Self {
        Self {
            client: reqwest::Client::new(),
            server,
            timeouts,
        }
    }

    pub fn from_endpoint(endpoint: &EndpointConfig, api: &BeaconApiConfig) -> Result<Self, Error> {
        let server = Url::parse(&endpoint.url)?;
        Ok(Self::new(
            server,
            Timeouts {
                duties: Duration::from_secs(api.duty_call_timeout_secs),
                validator_set: Duration::from_secs(api.validator_set_call_timeout_secs),
            },
        ))
    }

    fn path(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.server.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl("URL cannot be a base".to_string()))?
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url, timeout: Duration) -> Result<T, Error> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        ok_or_error(response)
            .await?
            .json()
            .await
            .map_err(Into::into)
    }

    /// As `get`, but treats a 404 as `None` rather than an error.
    async fn get_opt<T: DeserializeOwned>(
        &self,
        url: Url,
        timeout: Duration,
    ) -> Result<Option<T>, Error> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        ok_or_error(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(Into::into)
    }
}

#[async_trait]
impl BeaconRpc for BeaconNodeHttpClient {
    /// `GET eth/v1/validator/duties/proposer/{epoch}`
    async fn proposer_duties(
        &self,
        epoch: Epoch,
    ) -> Result<DutiesResponse<Vec<ProposerData>>, Error> {
        let url = self.path(&[
            "eth",
            "v1",
            "validator",
            "duties",
            "proposer",
            &epoch.to_string(),
        ])?;
        self.get(url, self.timeouts.duties).await
    }

    /// `GET eth/v1/beacon/states/{state_id}/committees?epoch={epoch}`
    async fn committee_duties(
        &self,
        state_id: &StateId,
        epoch: Epoch,
    ) -> Result<Vec<CommitteeData>, Error> {
        let mut url = self.path(&[
            "eth",
            "v1",
            "beacon",
            "states",
            &state_id.to_string(),
            "committees",
        ])?;
        url.query_pairs_mut()
            .append_pair("epoch", &epoch.to_string());
        self.get::<GenericResponse<Vec<CommitteeData>>>(url, self.timeouts.duties)
            .await
            .map(|resp| resp.data)
    }

    /// `GET eth/v1/beacon/states/{state_id}/sync_committees?epoch={epoch}`
    async fn sync_committee(
        &self,
        state_id: &StateId,
        epoch: Epoch,
    ) -> Result<Option<SyncCommitteeData>, Error> {
        let mut url = self.path(&[
            "eth",
            "v1",
            "beacon",
            "states",
            &state_id.to_string(),
            "sync_committees",
        ])?;
        url.query_pairs_mut()
            .append_pair("epoch", &epoch.to_string());
        self.get_opt::<GenericResponse<SyncCommitteeData>>(url, self.timeouts.duties)
            .await
            .map(|resp| resp.map(|resp| resp.data))
    }

    /// `GET eth/v1/beacon/states/{state_id}/validators`
    async fn state_validators(&self, state_id: &StateId) -> Result<Vec<ValidatorData>, Error> {
        let url = self.path(&[
            "eth",
            "v1",
            "beacon",
            "states",
            &state_id.to_string(),
            "validators",
        ])?;
        self.get::<GenericResponse<Vec<ValidatorData>>>(url, self.timeouts.validator_set)
            .await
            .map(|resp| resp.data)
    }

    /// `GET eth/v1/beacon/headers/{root}`
    async fn block_header(&self, root: Hash256) -> Result<Option<BlockHeaderData>, Error> {
        let url = self.path(&["eth", "v1", "beacon", "headers", &format!("{:?}", root)])?;
        self.get_opt::<GenericResponse<BlockHeaderData>>(url, self.timeouts.duties)
            .await
            .map(|resp| resp.map(|resp| resp.data))
    }

    /// `GET eth/v1/beacon/headers/{slot}`
    async fn block_header_by_slot(&self, slot: Slot) -> Result<Option<BlockHeaderData>, Error> {
        let url = self.path(&["eth", "v1", "beacon", "headers", &slot.to_string()])?;
        self.get_opt::<GenericResponse<BlockHeaderData>>(url, self.timeouts.duties)
            .await
            .map(|resp| resp.map(|resp| resp.data))
    }

    /// `GET eth/v2/beacon/blocks/{root}`
    async fn block_body(&self, root: Hash256) -> Result<Option<SignedBeaconBlock>, Error> {
        let url = self.path(&["eth", "v2", "beacon", "blocks", &format!("{:?}", root)])?;
        self.get_opt::<ForkVersionedResponse<SignedBeaconBlock>>(url, self.timeouts.duties)
            .await
            .map(|resp| resp.map(|resp| resp.data))
    }

    /// `GET eth/v1/beacon/states/head/finality_checkpoints`
    async fn finality_checkpoints(&self) -> Result<FinalityCheckpointsData, Error> {
        let url = self.path(&[
            "eth",
            "v1",
            "beacon",
            "states",
            "head",
            "finality_checkpoints",
        ])?;
        self.get::<GenericResponse<FinalityCheckpointsData>>(url, self.timeouts.duties)
            .await
            .map(|resp| resp.data)
    }

    /// `GET eth/v1/beacon/genesis`
    async fn genesis(&self) -> Result<GenesisData, Error> {
        let url = self.path(&["eth", "v1", "beacon", "genesis"])?;
        self.get::<GenericResponse<GenesisData>>(url, self.timeouts.duties)
            .await
            .map(|resp| resp.data)
    }

    /// `GET eth/v1/events?topics=head`, parsed as a server-sent event stream.
    ///
    /// Runs until the connection drops, the stream errors or the receiver is gone.
    async fn stream_head(&self, tx: UnboundedSender<SseHead>) -> Result<(), Error> {
        let mut url = self.path(&["eth", "v1", "events"])?;
        url.query_pairs_mut().append_pair("topics", "head");

        // No timeout: the subscription is expected to stay open indefinitely.
        let response = self.client.get(url).send().await?;
        let mut stream = ok_or_error(response).await?.bytes_stream();

        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);

            // Messages are delimited by a blank line.
            while let Some(end) = find_frame_end(&buffer) {
                let frame: Vec<u8> = buffer.drain(..end + 2).collect();
                let frame = &frame[..end];
                if frame.is_empty() || frame.starts_with(b":") {
                    // Keep-alive comment.
                    continue;
                }
                match SseHead::from_sse_bytes(frame) {
                    Ok(Some(head)) => {
                        if tx.send(head).is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Err(Error::InvalidServerSentEvent(e)),
                }
            }
        }

        Ok(())
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

async fn ok_or_error(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let message = response.text().await.unwrap_or_default();
        Err(Error::ServerMessage {
            status: status.as_u16(),
            message,
        })
    }
}
