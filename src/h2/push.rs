//! Server push, client side.
//!
//! The driver turns PUSH_PROMISE and the promised stream's frames into
//! [`PushEvent`]s. A single worker feeds them, in order, to the user's
//! [`PushObserver`]; any callback can cancel the push.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::h2::connection::{Inner, RecentIds, PUSH_QUEUE_DEPTH};
use crate::h2::frame::ErrorCode;
use crate::h2::header::Header;
use crate::h2::worker::Control;

/// Receives pushed streams.
///
/// Callbacks run on a background task, one at a time, in wire order for each
/// promised stream. Returning `false` from any of the first three cancels the
/// push with RST_STREAM(CANCEL); no further callbacks arrive for that stream.
pub trait PushObserver: Send + 'static {
    /// A PUSH_PROMISE arrived on `associated_stream_id`.
    fn on_request(
        &mut self,
        associated_stream_id: u32,
        promised_stream_id: u32,
        request_headers: &[Header],
    ) -> bool;

    /// Response headers (or trailers) for a promised stream.
    fn on_headers(&mut self, promised_stream_id: u32, headers: &[Header], end_stream: bool) -> bool;

    /// Body bytes for a promised stream.
    fn on_data(&mut self, promised_stream_id: u32, data: Bytes, end_stream: bool) -> bool;

    /// The server reset a promised stream.
    fn on_reset(&mut self, promised_stream_id: u32, code: ErrorCode);
}

/// Observer that cancels every push.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectPushes;

impl PushObserver for RejectPushes {
    fn on_request(&mut self, _: u32, promised_stream_id: u32, _: &[Header]) -> bool {
        tracing::debug!("rejecting push of stream {}", promised_stream_id);
        false
    }

    fn on_headers(&mut self, _: u32, _: &[Header], _: bool) -> bool {
        false
    }

    fn on_data(&mut self, _: u32, _: Bytes, _: bool) -> bool {
        false
    }

    fn on_reset(&mut self, _: u32, _: ErrorCode) {}
}

/// One step of a pushed stream, as seen by the driver.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PushEvent {
    Promise {
        associated_stream_id: u32,
        promised_stream_id: u32,
        headers: Vec<Header>,
    },
    Headers {
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    Reset {
        stream_id: u32,
        code: ErrorCode,
    },
}

impl PushEvent {
    fn stream_id(&self) -> u32 {
        match self {
            PushEvent::Promise {
                promised_stream_id, ..
            } => *promised_stream_id,
            PushEvent::Headers { stream_id, .. }
            | PushEvent::Data { stream_id, .. }
            | PushEvent::Reset { stream_id, .. } => *stream_id,
        }
    }
}

/// Feed push events to the observer until the driver goes away.
pub(crate) async fn run_push_worker(
    inner: Arc<Inner>,
    mut observer: Box<dyn PushObserver>,
    mut rx: mpsc::Receiver<PushEvent>,
) {
    // Once cancelled, the driver stops producing events for an id, so only
    // events already queued can still name it.
    let mut cancelled = RecentIds::with_capacity(PUSH_QUEUE_DEPTH * 2);

    while let Some(event) = rx.recv().await {
        let stream_id = event.stream_id();
        if cancelled.contains(stream_id) {
            continue;
        }

        let keep = match event {
            PushEvent::Promise {
                associated_stream_id,
                promised_stream_id,
                headers,
            } => observer.on_request(associated_stream_id, promised_stream_id, &headers),
            PushEvent::Headers {
                stream_id,
                headers,
                end_stream,
            } => observer.on_headers(stream_id, &headers, end_stream),
            PushEvent::Data {
                stream_id,
                data,
                end_stream,
            } => observer.on_data(stream_id, data, end_stream),
            PushEvent::Reset { stream_id, code } => {
                observer.on_reset(stream_id, code);
                true
            }
        };

        if !keep {
            tracing::debug!("push of stream {} cancelled by observer", stream_id);
            cancelled.insert(stream_id);
            let still_open = {
                let mut conn = inner.lock_state();
                let still_open = conn.pushed.remove(&stream_id).is_some();
                if still_open {
                    conn.recent_resets.insert(stream_id);
                }
                still_open
            };
            if still_open {
                inner
                    .enqueue(Control::Reset {
                        stream_id,
                        code: ErrorCode::Cancel,
                    })
                    .await;
            }
        }
    }
    tracing::trace!("push worker exiting");
}
