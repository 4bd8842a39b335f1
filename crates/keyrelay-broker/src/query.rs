//! Query reply sequences and their aggregation.
//!
//! [`QueryReplies`] is the lazy, non-restartable sequence returned by
//! [`SessionManager::query`]. It ends when the broker completes the query or
//! when the response deadline passes, whichever comes first; partial results
//! are valid. Dropping it (or calling [`QueryReplies::cancel`]) releases the
//! broker-side query.
//!
//! [`QueryCoordinator`] drains a sequence into a bounded, ordered list.

use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use keyrelay_core::{KeyExpr, Reply};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::QueryError;
use crate::manager::SessionManager;
use crate::session::ReplyStream;

/// How a reply sequence ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTermination {
    /// The broker signaled completion.
    Completed,
    /// The response deadline passed first.
    TimedOut,
    /// The consumer stopped early (cancel or reply limit).
    Cancelled,
}

/// Lazy sequence of replies for one query.
pub struct QueryReplies {
    rx: Option<ReplyStream>,
    deadline: Instant,
    termination: Option<QueryTermination>,
}

impl QueryReplies {
    /// Wrap a broker reply stream, finalizing after `timeout`.
    pub fn new(rx: ReplyStream, timeout: Duration) -> Self {
        Self {
            rx: Some(rx),
            deadline: Instant::now() + timeout,
            termination: None,
        }
    }

    /// Next reply in arrival order, or `None` once finalized.
    pub async fn next(&mut self) -> Option<Reply> {
        let rx = self.rx.as_mut()?;
        match tokio::time::timeout_at(self.deadline, rx.recv()).await {
            Ok(Some(reply)) => Some(reply),
            Ok(None) => {
                self.finish(QueryTermination::Completed);
                None
            }
            Err(_elapsed) => {
                self.finish(QueryTermination::TimedOut);
                None
            }
        }
    }

    /// Stop consuming. Replies still in flight are discarded.
    pub fn cancel(&mut self) {
        if self.rx.is_some() {
            self.finish(QueryTermination::Cancelled);
        }
    }

    /// How the sequence ended, once it has.
    pub fn termination(&self) -> Option<QueryTermination> {
        self.termination
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Reply> + Send {
        futures::stream::unfold(self, |mut replies| async move {
            replies.next().await.map(|reply| (reply, replies))
        })
    }

    fn finish(&mut self, termination: QueryTermination) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
        self.termination = Some(termination);
    }
}

/// Aggregated result of one query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Replies in arrival order, `Ok` and `Err` alike.
    pub replies: Vec<Reply>,
    /// How collection ended.
    pub termination: QueryTermination,
    /// Whether the reply limit cut collection short.
    pub truncated: bool,
}

impl QueryOutcome {
    /// Whether the broker completed the query before collection stopped.
    pub fn is_complete(&self) -> bool {
        self.termination == QueryTermination::Completed
    }
}

/// Runs queries through a [`SessionManager`] and collects the replies.
#[derive(Clone)]
pub struct QueryCoordinator {
    session: SessionManager,
    max_replies: usize,
}

impl QueryCoordinator {
    /// Collect at most `max_replies` replies per query.
    pub fn new(session: SessionManager, max_replies: usize) -> Self {
        Self {
            session,
            max_replies: max_replies.max(1),
        }
    }

    /// Execute a query and wait for its final reply list.
    ///
    /// Per-reply errors are kept in place and never stop collection. The
    /// outcome is truncated only when a reply beyond the limit arrives; a
    /// query yielding exactly `max_replies` replies still completes.
    pub async fn execute(&self, pattern: &KeyExpr, payload: Option<Bytes>) -> Result<QueryOutcome, QueryError> {
        let mut replies = self.session.query(pattern, payload).await?;
        let mut collected = Vec::new();
        let mut truncated = false;

        while let Some(reply) = replies.next().await {
            // a reply past the limit marks the outcome truncated
            if collected.len() == self.max_replies {
                truncated = true;
                replies.cancel();
                break;
            }
            collected.push(reply);
        }

        let termination = replies
            .termination()
            .unwrap_or(QueryTermination::Cancelled);
        let errors = collected.iter().filter(|r| !r.is_ok()).count();
        debug!(
            %pattern,
            replies = collected.len(),
            errors,
            ?termination,
            truncated,
            "query finished"
        );
        Ok(QueryOutcome {
            replies: collected,
            termination,
            truncated,
        })
    }
}
