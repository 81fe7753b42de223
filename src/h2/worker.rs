//! Background writers.
//!
//! The driver never touches the writer lock. Frames it must send in reply
//! (SETTINGS/PING ACKs, RST_STREAM, WINDOW_UPDATE) go through a bounded queue
//! drained here.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::error::{Error, Result};
use crate::h2::codec::{BoxedWrite, FrameWriter};
use crate::h2::connection::{Inner, KEEPALIVE_PAYLOAD};
use crate::h2::frame::{ErrorCode, PingFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame};

/// A deferred control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Control {
    /// ACK the peer's SETTINGS, first applying what affects our writer.
    SettingsAck {
        header_table_size: Option<u32>,
        max_frame_size: Option<u32>,
    },
    PingAck([u8; 8]),
    Reset {
        stream_id: u32,
        code: ErrorCode,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
}

fn apply(writer: &mut FrameWriter<BoxedWrite>, control: Control) -> Result<()> {
    match control {
        Control::SettingsAck {
            header_table_size,
            max_frame_size,
        } => {
            if let Some(size) = header_table_size {
                writer.set_header_table_size(size);
            }
            if let Some(size) = max_frame_size {
                writer.set_max_frame_size(size);
            }
            writer.buffer(SettingsFrame::ack().serialize())
        }
        Control::PingAck(data) => writer.buffer(PingFrame::ack(data).serialize()),
        Control::Reset { stream_id, code } => {
            writer.buffer(RstStreamFrame::new(stream_id, code).serialize())
        }
        Control::WindowUpdate {
            stream_id,
            increment,
        } => writer.buffer(WindowUpdateFrame::new(stream_id, increment).serialize()),
    }
}

/// Drain the control queue into the writer, batching whatever is queued.
///
/// Exits when every sender is gone. Write failures are logged and swallowed;
/// the driver notices a dead transport on its own.
pub(crate) async fn run_control_writer(
    writer: Arc<AsyncMutex<FrameWriter<BoxedWrite>>>,
    mut rx: mpsc::Receiver<Control>,
    closed: watch::Receiver<bool>,
) {
    while let Some(first) = rx.recv().await {
        let mut writer = writer.lock().await;
        let mut next = Some(first);
        while let Some(control) = next {
            if let Err(e) = apply(&mut writer, control) {
                tracing::warn!("dropping control frame: {}", e);
            }
            next = rx.try_recv().ok();
        }

        if let Err(e) = writer.flush().await {
            if *closed.borrow() {
                tracing::debug!("control write after close failed: {}", e);
            } else {
                tracing::warn!("control write failed: {}", e);
            }
        }
    }
    tracing::trace!("control writer exiting");
}

/// Send a keepalive PING every `interval`.
///
/// If the previous keepalive is still unacknowledged at the next tick the
/// connection is closed with [`Error::PingTimeout`].
pub(crate) async fn run_keepalive(
    inner: Weak<Inner>,
    interval: Duration,
    mut closed: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = async { let _ = closed.wait_for(|c| *c).await; } => return,
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let outstanding = {
            let mut conn = inner.lock_state();
            if conn.closed.is_some() {
                return;
            }
            std::mem::replace(&mut conn.keepalive_outstanding, true)
        };

        if outstanding {
            tracing::warn!("keepalive PING unanswered after {:?}, closing", interval);
            inner
                .terminate(
                    Error::PingTimeout(interval),
                    ErrorCode::NoError,
                    ErrorCode::Cancel,
                )
                .await;
            return;
        }

        tracing::trace!("sending keepalive PING");
        if let Err(e) = inner
            .write_frame(PingFrame::new(KEEPALIVE_PAYLOAD).serialize())
            .await
        {
            tracing::debug!("keepalive PING failed: {}", e);
            return;
        }
    }
}
