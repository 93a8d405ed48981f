//! Writer thread: the single consumer of frames bound for the TUN device.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::EngineContext;
use crate::device::TunDevice;

/// Drain the frame queue onto the device. Frames keep their queue order,
/// which preserves per-flow ordering. An empty frame ends the loop.
pub fn run_writer(device: Arc<TunDevice>, mut frames: mpsc::Receiver<Vec<u8>>, ctx: Arc<EngineContext>) {
    tracing::debug!(device = %device.config().name, "writer started");

    while let Some(frame) = frames.blocking_recv() {
        if frame.is_empty() {
            break;
        }
        match device.write_packet(&frame) {
            Ok(n) if n == frame.len() => {}
            Ok(n) => {
                ctx.stats.record_drop();
                tracing::warn!(written = n, len = frame.len(), "short write to tun device");
            }
            Err(e) => {
                ctx.stats.record_drop();
                tracing::warn!(error = %e, len = frame.len(), "failed to write frame");
            }
        }
    }

    tracing::debug!("writer stopped");
}
