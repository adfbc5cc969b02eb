//! Raft peer RPC: request/response shapes and the reqwest-backed client.
//!
//! Peer traffic rides the metadata node's HTTP listener as JSON under
//! `/raft/*`; there is no separate transport to operate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::{Error, Result};
use crate::meta::fsm::FsmSnapshot;
use crate::meta::log::LogEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    pub leader_addr: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// Follower's last matching index on success; hint for next_index on
    /// rejection
    pub match_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub leader_addr: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub snapshot: FsmSnapshot,
    pub membership: Vec<Peer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// A voting member of the consensus group. `addr` is the node's HTTP base
/// URL, used both for peer RPC and for client redirects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub accepted: bool,
    /// Set when the contacted node is not the leader
    pub leader_addr: Option<String>,
}

/// HTTP client for peer RPC
#[derive(Clone)]
pub struct RaftClient {
    http: reqwest::Client,
}

impl RaftClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { http }
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        addr: &str,
        path: &str,
        req: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{}", addr.trim_end_matches('/'), path);
        let resp = self.http.post(&url).json(req).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Raft(format!(
                "peer {} returned {}",
                url,
                resp.status()
            )));
        }

        Ok(resp.json().await?)
    }

    pub async fn request_vote(&self, addr: &str, req: &VoteRequest) -> Result<VoteResponse> {
        self.post(addr, "/raft/vote", req).await
    }

    pub async fn append_entries(&self, addr: &str, req: &AppendRequest) -> Result<AppendResponse> {
        self.post(addr, "/raft/append", req).await
    }

    pub async fn install_snapshot(
        &self,
        addr: &str,
        req: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.post(addr, "/raft/snapshot", req).await
    }

    pub async fn join(&self, addr: &str, req: &JoinRequest) -> Result<JoinResponse> {
        self.post(addr, "/raft/join", req).await
    }

    pub async fn timeout_now(&self, addr: &str) -> Result<()> {
        let url = format!("{}/raft/timeout-now", addr.trim_end_matches('/'));
        let resp = self.http.post(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Raft(format!(
                "timeout-now to {} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }
}
