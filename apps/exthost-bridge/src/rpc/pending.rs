use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use super::{RpcError, Shared};
use crate::metrics;

type Reply = Result<Value, RpcError>;

enum State {
    Ready(Reply),
    Waiting {
        rx: oneshot::Receiver<Reply>,
        shared: Weak<Shared>,
        deadline: Option<(Pin<Box<Sleep>>, Duration)>,
    },
    Done,
}

/// Deferred result of an outbound call.
///
/// The request frame is already enqueued when this is returned. Dropping it
/// before it resolves forgets the pending entry and tells the peer to cancel.
#[must_use = "dropping a PendingReply cancels the call"]
pub struct PendingReply {
    id: u64,
    state: State,
}

impl PendingReply {
    pub(super) fn waiting(
        id: u64,
        rx: oneshot::Receiver<Reply>,
        shared: Weak<Shared>,
        timeout: Option<Duration>,
    ) -> Self {
        let deadline = timeout.map(|limit| (Box::pin(tokio::time::sleep(limit)), limit));
        Self {
            id,
            state: State::Waiting {
                rx,
                shared,
                deadline,
            },
        }
    }

    pub(super) fn ready(id: u64, result: Reply) -> Self {
        Self {
            id,
            state: State::Ready(result),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves and deserializes the result.
    pub async fn into_typed<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let value = self.await?;
        serde_json::from_value(value).map_err(|err| RpcError::Serialization(err.to_string()))
    }
}

impl Future for PendingReply {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.id;
        match &mut this.state {
            State::Ready(_) => match std::mem::replace(&mut this.state, State::Done) {
                State::Ready(result) => Poll::Ready(result),
                _ => Poll::Ready(Err(RpcError::Disconnected)),
            },
            State::Waiting {
                rx,
                shared,
                deadline,
            } => {
                if let Poll::Ready(result) = Pin::new(rx).poll(cx) {
                    this.state = State::Done;
                    return Poll::Ready(result.unwrap_or(Err(RpcError::Disconnected)));
                }
                if let Some((sleep, limit)) = deadline {
                    if sleep.as_mut().poll(cx).is_ready() {
                        let limit = *limit;
                        if let Some(shared) = shared.upgrade() {
                            shared.abandon_call(id);
                        }
                        metrics::RPC_CALLS.with_label_values(&["timeout"]).inc();
                        this.state = State::Done;
                        return Poll::Ready(Err(RpcError::Timeout(limit)));
                    }
                }
                Poll::Pending
            }
            State::Done => Poll::Ready(Err(RpcError::Disconnected)),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let State::Waiting { shared, .. } = &self.state {
            if let Some(shared) = shared.upgrade() {
                if shared.abandon_call(self.id) {
                    metrics::RPC_CALLS.with_label_values(&["dropped"]).inc();
                }
            }
        }
    }
}
