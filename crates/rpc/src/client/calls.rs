//! In-flight calls awaiting a response.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::ClientError;

pub(crate) type Completion = oneshot::Receiver<Result<Bytes, ClientError>>;

struct PendingCall {
    /// Monotonic issue order, independent of seq wraparound.
    ticket: u64,
    completion: oneshot::Sender<Result<Bytes, ClientError>>,
    /// Encoded request, held until the call is first written.
    buffered: Option<Bytes>,
}

/// Pending calls keyed by sequence number.
#[derive(Default)]
pub(crate) struct CallRegistry {
    pending: Mutex<HashMap<u16, PendingCall>>,
}

impl CallRegistry {
    pub(crate) fn register(&self, seq: u16, ticket: u64, buffered: Option<Bytes>) -> Completion {
        let (completion, rx) = oneshot::channel();
        let previous = self.pending.lock().insert(
            seq,
            PendingCall {
                ticket,
                completion,
                buffered,
            },
        );

        if previous.is_some() {
            warn!(seq, "Sequence number reused while a call was still pending");
        }

        rx
    }

    /// Settle the call waiting on `seq`. Returns `false` if there is none.
    pub(crate) fn complete(&self, seq: u16, result: Result<Bytes, ClientError>) -> bool {
        let Some(call) = self.pending.lock().remove(&seq) else {
            return false;
        };

        let _ = call.completion.send(result);
        true
    }

    /// Settle a specific call, leaving a newer call on the same seq alone.
    pub(crate) fn settle(&self, seq: u16, ticket: u64, result: Result<Bytes, ClientError>) {
        if let Some(call) = self.take(seq, ticket) {
            let _ = call.completion.send(result);
        }
    }

    /// Forget a specific call without settling it.
    pub(crate) fn discard(&self, seq: u16, ticket: u64) {
        self.take(seq, ticket);
    }

    fn take(&self, seq: u16, ticket: u64) -> Option<PendingCall> {
        let mut pending = self.pending.lock();
        match pending.get(&seq) {
            Some(call) if call.ticket == ticket => pending.remove(&seq),
            _ => None,
        }
    }

    /// Hand out every request still waiting for its first write, in issue
    /// order.
    pub(crate) fn take_buffered(&self) -> Vec<(u16, u64, Bytes)> {
        let mut buffered: Vec<_> = self
            .pending
            .lock()
            .iter_mut()
            .filter_map(|(seq, call)| {
                call.buffered
                    .take()
                    .map(|data| (*seq, call.ticket, data))
            })
            .collect();

        buffered.sort_by_key(|(_, ticket, _)| *ticket);
        buffered
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Removes a call from the registry when its caller stops waiting.
pub(crate) struct CallGuard<'a> {
    pub(crate) calls: &'a CallRegistry,
    pub(crate) seq: u16,
    pub(crate) ticket: u64,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.calls.discard(self.seq, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_settles_once() {
        let calls = CallRegistry::default();
        let completion = calls.register(1, 0, None);

        assert!(calls.complete(1, Ok(Bytes::from("done"))));
        assert!(!calls.complete(1, Ok(Bytes::from("again"))));
        assert_eq!(completion.await.unwrap().unwrap(), Bytes::from("done"));
        assert_eq!(calls.len(), 0);
    }

    #[tokio::test]
    async fn test_stale_ticket_leaves_newer_call() {
        let calls = CallRegistry::default();
        let _old = calls.register(5, 1, None);
        let newer = calls.register(5, 70_000, None);

        calls.discard(5, 1);
        assert_eq!(calls.len(), 1);

        calls.settle(5, 70_000, Err(ClientError::Rpc("nope".into())));
        assert!(matches!(newer.await.unwrap(), Err(ClientError::Rpc(_))));
    }

    #[test]
    fn test_take_buffered_in_issue_order() {
        let calls = CallRegistry::default();
        let _a = calls.register(65535, 10, Some(Bytes::from("a")));
        let _b = calls.register(0, 11, Some(Bytes::from("b")));
        let _c = calls.register(7, 12, None);
        let _d = calls.register(1, 13, Some(Bytes::from("d")));

        let buffered = calls.take_buffered();
        let order: Vec<_> = buffered.iter().map(|(seq, _, _)| *seq).collect();
        assert_eq!(order, vec![65535, 0, 1]);

        assert!(calls.take_buffered().is_empty());
        assert_eq!(calls.len(), 4);
    }

    #[test]
    fn test_guard_discards_on_drop() {
        let calls = CallRegistry::default();
        let _completion = calls.register(3, 9, None);
        {
            let _guard = CallGuard {
                calls: &calls,
                seq: 3,
                ticket: 9,
            };
        }
        assert_eq!(calls.len(), 0);
    }
}
