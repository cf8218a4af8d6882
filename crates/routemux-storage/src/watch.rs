//! Watch orchestration - binds hub subscriptions to request-scoped streams.
//!
//! Each watch spawns a forwarder task that is the sole owner of the
//! outbound channels: it pulls from the hub subscription, pushes to the
//! event channel, and closes both channels by exiting. Cancellation is
//! cooperative through a token, so a cancel lets an in-flight forward
//! finish and then tears the stream down.

use routemux_core::{EventHub, RouteWatch, RoutingError, RoutingEvent, RoutingStore, WatchFamily};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Buffered events between the forwarder and the transport reader.
const WATCH_CHANNEL_CAPACITY: usize = 32;

/// Open a watch from an untyped family name, as the transport supplies it.
///
/// An unknown family yields an already-closed pair whose error channel
/// holds a single `InvalidFamily`.
pub fn open_watch(store: &dyn RoutingStore, family: &str) -> RouteWatch {
    match family.parse::<WatchFamily>() {
        Ok(family) => store.watch_route_changes(family),
        Err(err) => closed_watch(Some(err)),
    }
}

/// Spawn the forwarder for a hub subscription and hand back the channel
/// triple. Used by both back-ends' `watch_route_changes`.
pub(crate) fn spawn_route_watch(hub: &EventHub<RoutingEvent>) -> RouteWatch {
    let mut subscription = hub.subscribe();
    let (event_tx, event_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let (error_tx, error_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    subscription.close();
                    break;
                }
                next = subscription.next() => match next {
                    Ok(event) => {
                        // a slow or dropped reader must not wedge the task
                        tokio::select! {
                            _ = token.cancelled() => {
                                subscription.close();
                                break;
                            }
                            sent = event_tx.send(event) => {
                                if sent.is_err() {
                                    subscription.close();
                                    break;
                                }
                            }
                        }
                    }
                    Err(RoutingError::Closed) => break,
                    Err(err) => {
                        warn!("[Watch] subscription terminated: {err}");
                        let _ = error_tx.try_send(err);
                        break;
                    }
                },
            }
        }
        // both tx halves drop here, closing the channels
    });

    RouteWatch::new(event_rx, error_rx, cancel)
}

/// A watch pair that is closed on arrival, optionally carrying one
/// terminal error.
pub(crate) fn closed_watch(err: Option<RoutingError>) -> RouteWatch {
    let (_event_tx, event_rx) = mpsc::channel(1);
    let (error_tx, error_rx) = mpsc::channel(1);
    if let Some(err) = err {
        let _ = error_tx.try_send(err);
    }
    drop(error_tx);

    let cancel = CancellationToken::new();
    cancel.cancel();
    RouteWatch::new(event_rx, error_rx, cancel)
}
