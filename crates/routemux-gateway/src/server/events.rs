//! Server-Sent-Events streams over route watches.
//!
//! Each stream owns its watch; dropping the response (client disconnect)
//! cancels the watch through `RouteWatch`'s drop hook. Internal
//! `Create`/`Update` events collapse to `Upsert` on the wire and
//! `Delete`/`Expire` to `Delete`; the `id` field is a per-stream sequence
//! number. A heartbeat comment every 30 seconds keeps intermediaries from
//! closing an otherwise idle stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures_core::Stream;
use routemux_core::{RouteWatch, RoutingEvent, WatchFamily};
use tracing::debug;

use super::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn http_events(State(state): State<AppState>) -> Sse<KeepAliveStream<EventStream>> {
    debug!("[Gateway] Opening http event stream");
    sse_response(state.store.watch_route_changes(WatchFamily::Http))
}

pub async fn tcp_events(State(state): State<AppState>) -> Sse<KeepAliveStream<EventStream>> {
    debug!("[Gateway] Opening tcp event stream");
    sse_response(state.store.watch_route_changes(WatchFamily::Tcp))
}

fn sse_response(watch: RouteWatch) -> Sse<KeepAliveStream<EventStream>> {
    Sse::new(EventStream { watch, next_id: 0 })
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL))
}

/// Adapts a route watch into SSE frames. The stream ends when the watch
/// closes, which in turn ends the HTTP response.
pub struct EventStream {
    watch: RouteWatch,
    next_id: u64,
}

impl EventStream {
    fn frame(&mut self, event: RoutingEvent) -> Event {
        let id = self.next_id;
        self.next_id += 1;
        Event::default()
            .id(id.to_string())
            .event(event.event_type().wire_action())
            .data(event.payload_json().to_string())
    }
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.watch.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let frame = this.frame(event);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
