//! Fan-out of one message to every registered connection but its origin.

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::registry::{ClientRegistry, ClientToken};

/// Outcome of a single [`broadcast`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<ClientToken>,
}

/// Sends `message` to every connection in a registry snapshot except `origin`.
///
/// Sends run concurrently, so a slow recipient only delays this broadcast by
/// its own write timeout. A recipient whose send fails is unregistered and
/// closed after the pass; the others are unaffected.
pub async fn broadcast(
    registry: &ClientRegistry,
    message: &Bytes,
    origin: ClientToken,
) -> BroadcastReport {
    let recipients: Vec<_> = registry
        .snapshot()
        .await
        .into_iter()
        .filter(|(token, _)| *token != origin)
        .collect();

    let outcomes = join_all(recipients.iter().map(|(token, peer)| async move {
        (*token, peer, peer.send(message).await)
    }))
    .await;

    let mut report = BroadcastReport::default();
    let mut evicted = Vec::new();
    for (token, peer, outcome) in outcomes {
        match outcome {
            Ok(()) => report.delivered += 1,
            Err(error) => {
                warn!(peer = %peer.addr(), %token, ?error, "failed to relay message");
                report.failed.push(token);
                evicted.push(peer);
            }
        }
    }

    for (token, peer) in report.failed.iter().zip(evicted) {
        registry.unregister(*token).await;
        peer.close().await;
    }

    debug!(
        %origin,
        bytes = message.len(),
        delivered = report.delivered,
        failed = report.failed.len(),
        "broadcast complete"
    );
    report
}
