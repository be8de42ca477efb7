//! FIFO correlation of outgoing requests with their eventual replies.
//!
//! FreeSWITCH's command and API replies carry no request identifier: a
//! `command/reply` or `api/response` frame simply answers the oldest
//! outstanding request of its kind, in the order requests were sent. The
//! caller's own `oneshot::Sender` is queued directly (mirroring hyper's
//! client dispatch, which hands a fresh oneshot per request rather than
//! routing through an intermediate table), so resolving a reply never
//! needs more than a `VecDeque::pop_front`.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;
use tracing::error;

use crate::error::Error;
use crate::message::Message;

pub(crate) type Reply = Result<Message, Error>;

/// Tracks outstanding `command/reply` and `api/response` requests in
/// send order, plus outstanding background jobs by `Job-UUID`.
pub(crate) struct Correlator {
    command_replies: VecDeque<oneshot::Sender<Reply>>,
    api_replies: VecDeque<oneshot::Sender<Reply>>,
    background_jobs: HashMap<String, oneshot::Sender<Reply>>,
}

impl Correlator {
    pub(crate) fn new() -> Correlator {
        Correlator {
            command_replies: VecDeque::new(),
            api_replies: VecDeque::new(),
            background_jobs: HashMap::new(),
        }
    }

    /// Register a pending `command/reply`. Must be called before the
    /// corresponding request bytes are written, so the reply cannot race
    /// the registration.
    pub(crate) fn expect_command_reply(&mut self, reply: oneshot::Sender<Reply>) {
        self.command_replies.push_back(reply);
    }

    /// Register a pending `api/response`.
    pub(crate) fn expect_api_reply(&mut self, reply: oneshot::Sender<Reply>) {
        self.api_replies.push_back(reply);
    }

    /// Register a pending background job, keyed by the `Job-UUID` this
    /// crate generated for the `bgapi` request. Note that `bgapi`'s
    /// immediate `command/reply` is purely informational and must never
    /// be enqueued on `command_replies` — doing so is the historical bug
    /// this correlator is built to avoid.
    pub(crate) fn expect_background_job(&mut self, job_uuid: String, reply: oneshot::Sender<Reply>) {
        self.background_jobs.insert(job_uuid, reply);
    }

    /// Resolve the oldest pending command reply. Logs at error and
    /// discards the reply if nothing is pending — per the wire protocol
    /// every `command/reply` should answer a request this crate sent,
    /// so an empty queue here means a reply arrived unmatched.
    pub(crate) fn resolve_command_reply(&mut self, reply: Reply) {
        match self.command_replies.pop_front() {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => error!("command/reply arrived with no pending command request"),
        }
    }

    /// Resolve the oldest pending API reply. Logs at error and discards
    /// the reply if nothing is pending.
    pub(crate) fn resolve_api_reply(&mut self, reply: Reply) {
        match self.api_replies.pop_front() {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => error!("api/response arrived with no pending api request"),
        }
    }

    /// Resolve a background job by its `Job-UUID`, if still pending.
    /// Logs at error and continues if the `Job-UUID` is unknown (it may
    /// belong to a prior session).
    pub(crate) fn resolve_background_job(&mut self, job_uuid: &str, reply: Reply) {
        match self.background_jobs.remove(job_uuid) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => error!(job_uuid, "BACKGROUND_JOB event arrived with no pending job"),
        }
    }

    /// Fail every outstanding request, draining all three tables. Called
    /// once when the connection is lost, so no caller is left awaiting a
    /// reply that will never arrive.
    pub(crate) fn fail_all(&mut self) {
        while let Some(tx) = self.command_replies.pop_front() {
            let _ = tx.send(Err(Error::connection_lost()));
        }
        while let Some(tx) = self.api_replies.pop_front() {
            let _ = tx.send(Err(Error::connection_lost()));
        }
        for (_, tx) in self.background_jobs.drain() {
            let _ = tx.send(Err(Error::connection_lost()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeaderMap;

    fn reply(text: &str) -> Reply {
        let mut headers = HeaderMap::new();
        headers.insert("Reply-Text", text);
        Ok(Message::new(headers, Default::default()))
    }

    #[tokio::test]
    async fn command_replies_resolve_fifo() {
        let mut correlator = Correlator::new();
        let (tx1, first) = oneshot::channel();
        let (tx2, second) = oneshot::channel();
        correlator.expect_command_reply(tx1);
        correlator.expect_command_reply(tx2);

        correlator.resolve_command_reply(reply("+OK first"));
        correlator.resolve_command_reply(reply("+OK second"));

        assert_eq!(first.await.unwrap().unwrap().header("Reply-Text"), Some("+OK first"));
        assert_eq!(second.await.unwrap().unwrap().header("Reply-Text"), Some("+OK second"));
    }

    #[tokio::test]
    async fn background_job_resolves_by_uuid_not_fifo_order() {
        let mut correlator = Correlator::new();
        let (tx_a, a) = oneshot::channel();
        let (tx_b, b) = oneshot::channel();
        correlator.expect_background_job("job-a".into(), tx_a);
        correlator.expect_background_job("job-b".into(), tx_b);

        correlator.resolve_background_job("job-b", reply("+OK b"));
        correlator.resolve_background_job("job-a", reply("+OK a"));

        assert_eq!(a.await.unwrap().unwrap().header("Reply-Text"), Some("+OK a"));
        assert_eq!(b.await.unwrap().unwrap().header("Reply-Text"), Some("+OK b"));
    }

    #[tokio::test]
    async fn informational_bgapi_ack_never_touches_command_fifo() {
        let mut correlator = Correlator::new();
        let (command_tx, command) = oneshot::channel();
        let (job_tx, job) = oneshot::channel();
        correlator.expect_command_reply(command_tx);
        correlator.expect_background_job("job-a".into(), job_tx);

        // bgapi's own ack resolves only the job table; an unrelated
        // command queued earlier must still get its own reply.
        correlator.resolve_command_reply(reply("+OK unrelated command"));
        correlator.resolve_background_job("job-a", reply("+OK job done"));

        assert_eq!(command.await.unwrap().unwrap().header("Reply-Text"), Some("+OK unrelated command"));
        assert_eq!(job.await.unwrap().unwrap().header("Reply-Text"), Some("+OK job done"));
    }

    #[tokio::test]
    async fn fail_all_resolves_every_outstanding_promise_with_an_error() {
        let mut correlator = Correlator::new();
        let (command_tx, command) = oneshot::channel();
        let (api_tx, api) = oneshot::channel();
        let (job_tx, job) = oneshot::channel();
        correlator.expect_command_reply(command_tx);
        correlator.expect_api_reply(api_tx);
        correlator.expect_background_job("job-a".into(), job_tx);

        correlator.fail_all();

        assert!(command.await.unwrap().unwrap_err().is_connection_lost());
        assert!(api.await.unwrap().unwrap_err().is_connection_lost());
        assert!(job.await.unwrap().unwrap_err().is_connection_lost());
    }
}
