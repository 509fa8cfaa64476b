//! Holder: the request-id -> waiter map that correlates asynchronous reply
//! events with blocked API callers.
//!
//! This is the only shared-mutable structure in the API manager. Waiters are
//! one-shot: for any request id exactly one of {OK reply, Error reply,
//! Timeout} reaches the caller, never more than one. Late replies for a
//! cancelled or timed-out request are dropped silently.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::CoreError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Error")]
    Error,
}

/// The terminal outcome of one API request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "reqID")]
    pub req_id: String,
    pub status: Status,
    #[serde(rename = "errCode", default)]
    pub err_code: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok(req_id: &str, data: Vec<u8>) -> Self {
        Response {
            req_id: req_id.to_string(),
            status: Status::Ok,
            err_code: String::new(),
            data,
        }
    }

    pub fn error(req_id: &str, err: &CoreError) -> Self {
        Response {
            req_id: req_id.to_string(),
            status: Status::Error,
            err_code: err.code().to_string(),
            data: Vec::new(),
        }
    }

    /// Payload on success, reconstructed error kind otherwise.
    pub fn into_result(self) -> Result<Vec<u8>, CoreError> {
        match self.status {
            Status::Ok => Ok(self.data),
            Status::Error => Err(CoreError::from_code(&self.err_code)),
        }
    }
}

/// Concurrent map from request id to a one-shot waiter.
#[derive(Default)]
pub struct Holder {
    waiters: DashMap<String, oneshot::Sender<Response>>,
}

impl Holder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Must happen before the request event is dispatched
    /// or a fast reply could race the registration.
    pub fn register(&self, req_id: &str) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(req_id.to_string(), tx);
        metrics::HOLDER_WAITERS.set(self.waiters.len() as i64);
        rx
    }

    /// Block until the reply arrives or `timeout` elapses. On timeout the
    /// waiter is removed so the eventual late reply is discarded.
    pub async fn wait(
        &self,
        req_id: &str,
        rx: oneshot::Receiver<Response>,
        timeout: Duration,
    ) -> Response {
        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(response)) => response,
            // Sender dropped without a reply: treat as cancelled.
            Ok(Err(_)) => Response::error(req_id, &CoreError::Timeout),
            Err(_) => {
                self.cancel(req_id);
                Response::error(req_id, &CoreError::Timeout)
            }
        }
    }

    /// Remove a waiter without replying (caller context cancelled).
    pub fn cancel(&self, req_id: &str) {
        self.waiters.remove(req_id);
        metrics::HOLDER_WAITERS.set(self.waiters.len() as i64);
    }

    /// Deliver a reply. Exactly one waiter wakes; replies with no registered
    /// waiter are dropped.
    pub fn on_respond(&self, response: Response) {
        let req_id = response.req_id.clone();
        match self.waiters.remove(&req_id) {
            Some((_, tx)) => {
                // The receiver may have been dropped between removal and
                // send; that is the same late-reply case.
                let _ = tx.send(response);
            }
            None => {
                debug!(req_id = %req_id, "dropping reply with no waiter");
            }
        }
        metrics::HOLDER_WAITERS.set(self.waiters.len() as i64);
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_wakes_waiter() {
        let holder = Holder::new();
        let rx = holder.register("r1");
        holder.on_respond(Response::ok("r1", b"payload".to_vec()));
        let response = holder.wait("r1", rx, Duration::from_secs(1)).await;
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.data, b"payload");
        assert_eq!(holder.pending(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_waiter_and_drops_late_reply() {
        let holder = Holder::new();
        let rx = holder.register("r1");
        let response = holder.wait("r1", rx, Duration::from_millis(10)).await;
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.err_code, "Timeout");
        assert_eq!(holder.pending(), 0);

        // The late reply has nowhere to go and is silently dropped.
        holder.on_respond(Response::ok("r1", Vec::new()));
        assert_eq!(holder.pending(), 0);
    }

    #[tokio::test]
    async fn exactly_one_outcome_per_request() {
        let holder = Holder::new();
        let rx = holder.register("r1");
        holder.on_respond(Response::ok("r1", b"first".to_vec()));
        holder.on_respond(Response::ok("r1", b"second".to_vec()));
        let response = holder.wait("r1", rx, Duration::from_secs(1)).await;
        assert_eq!(response.data, b"first");
    }

    #[tokio::test]
    async fn cancel_discards_reply() {
        let holder = Holder::new();
        let rx = holder.register("r1");
        holder.cancel("r1");
        holder.on_respond(Response::ok("r1", Vec::new()));
        // The receiver errors because its sender was dropped on cancel.
        let response = holder.wait("r1", rx, Duration::from_secs(1)).await;
        assert_eq!(response.err_code, "Timeout");
    }

    #[tokio::test]
    async fn concurrent_waiters_do_not_block_each_other() {
        let holder = std::sync::Arc::new(Holder::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let holder = holder.clone();
            let req_id = format!("r{}", i);
            let rx = holder.register(&req_id);
            tasks.push(tokio::spawn(async move {
                holder.wait(&req_id, rx, Duration::from_secs(2)).await
            }));
        }
        for i in 0..16 {
            holder.on_respond(Response::ok(&format!("r{}", i), vec![i as u8]));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let response = task.await.unwrap();
            assert_eq!(response.data, vec![i as u8]);
        }
    }

    #[test]
    fn response_result_mapping() {
        let ok = Response::ok("r", b"d".to_vec());
        assert_eq!(ok.into_result().unwrap(), b"d".to_vec());

        let err = Response::error("r", &CoreError::EntityNotFound("e1".into()));
        assert!(matches!(
            err.into_result(),
            Err(CoreError::EntityNotFound(_))
        ));
    }

    #[test]
    fn respond_body_wire_format() {
        let response = Response {
            req_id: "r1".into(),
            status: Status::Ok,
            err_code: String::new(),
            data: vec![1, 2],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["reqID"], "r1");
        assert_eq!(json["status"], "OK");
    }
}
