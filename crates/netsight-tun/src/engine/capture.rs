//! Capture thread: reads frames from the TUN device and feeds the flow table.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::EngineContext;
use crate::device::TunDevice;
use crate::packet::{validate_frame, PacketError};

use super::dispatch::{lock, FlowDispatcher};

/// Engine-wide stop flag plus the descriptors that interrupt the blocking
/// waits: a self-pipe for the capture poll and a mio waker for dispatch.
pub struct ShutdownSignal {
    triggered: AtomicBool,
    read_fd: RawFd,
    write_fd: RawFd,
    waker: Arc<mio::Waker>,
}

impl ShutdownSignal {
    pub fn new(waker: Arc<mio::Waker>) -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok(Self {
            triggered: AtomicBool::new(false),
            read_fd: fds[0],
            write_fd: fds[1],
            waker,
        })
    }

    /// Descriptor that becomes readable once the signal is triggered.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Ask every engine thread to stop. Safe to repeat.
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        let byte = 1u8;
        let n = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1) };
        if n < 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "failed to write interrupt pipe");
        }
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "failed to wake dispatch loop");
        }
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Validate one captured frame and route it. Invalid frames are counted and
/// dropped.
pub fn process_frame(flows: &Mutex<FlowDispatcher>, ctx: &EngineContext, frame: &[u8]) {
    match validate_frame(frame) {
        Ok(info) => {
            ctx.stats.record_outbound(frame.len());
            lock(flows).handle_frame(frame, &info);
        }
        Err(e @ (PacketError::LengthMismatch { .. } | PacketError::TooShort { .. })) => {
            ctx.stats.record_drop();
            tracing::error!(error = %e, len = frame.len(), "dropping truncated frame");
        }
        Err(e) => {
            ctx.stats.record_drop();
            tracing::trace!(error = %e, "dropping frame");
        }
    }
}

/// Capture thread body. Returns when the signal fires or the device fails;
/// a device failure triggers the signal itself.
pub fn run_capture(
    device: Arc<TunDevice>,
    flows: Arc<Mutex<FlowDispatcher>>,
    ctx: Arc<EngineContext>,
    signal: Arc<ShutdownSignal>,
) {
    let mut buf = vec![0u8; device.config().mtu as usize];
    let mut fds = [
        libc::pollfd {
            fd: device.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: signal.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    tracing::debug!(device = %device.config().name, "capture loop started");

    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %err, "capture poll failed, shutting down");
            signal.trigger();
            break;
        }
        if fds[1].revents != 0 || signal.is_triggered() {
            break;
        }

        let revents = fds[0].revents;
        if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            tracing::error!(revents, "tun device failed, shutting down");
            signal.trigger();
            break;
        }
        if revents & libc::POLLIN == 0 {
            continue;
        }

        match device.read_packet(&mut buf) {
            Ok(0) => continue,
            Ok(n) => process_frame(&flows, &ctx, &buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
            Err(e) => {
                tracing::error!(error = %e, "tun read failed, shutting down");
                signal.trigger();
                break;
            }
        }
    }

    tracing::debug!("capture loop stopped");
}
