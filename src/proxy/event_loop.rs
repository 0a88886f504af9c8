//! Main loop
//!
//! A single thread polls the client's input and output and the engine's
//! stdout and stderr. Each pass, in order:
//!
//! 1. drain engine stderr
//! 2. drain unsolicited engine stdout
//! 3. read and execute client commands, including lines left buffered
//!    when a forced render cut the previous pass short
//! 4. apply coalesced view changes
//! 5. capture a frame if one is due and none is queued
//! 6. write queued output if the client can take it
//!
//! A pending render waits for a lull in client traffic (the idle timeout)
//! unless a command forced it.

use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, trace, warn};

use super::session::{RenderFlags, Session};
use super::ProxyError;

/// Which descriptors poll reported, plus whether it timed out.
#[derive(Debug)]
struct Readiness {
    client_in: bool,
    engine_out: bool,
    engine_err: bool,
    client_out: bool,
    idle: bool,
}

/// Run until the client or the engine goes away; returns the reason.
pub fn run(session: &mut Session) -> ProxyError {
    info!("Proxy loop started");
    loop {
        if let Err(reason) = iterate(session) {
            info!("Proxy loop finished: {}", reason);
            return reason;
        }
    }
}

fn poll_timeout(session: &Session) -> PollTimeout {
    let flags = session.flags();
    if flags.contains(RenderFlags::FORCE_UPDATE) || session.has_client_line() {
        PollTimeout::ZERO
    } else if flags.contains(RenderFlags::UPDATE_PENDING) {
        let millis = session.idle_timeout().as_millis().min(u128::from(u16::MAX)) as u16;
        PollTimeout::from(millis)
    } else {
        PollTimeout::NONE
    }
}

fn is_ready(fd: &PollFd<'_>, wanted: PollFlags) -> bool {
    fd.revents()
        .is_some_and(|events| events.intersects(wanted | PollFlags::POLLHUP | PollFlags::POLLERR))
}

fn wait(session: &Session) -> Result<Option<Readiness>, ProxyError> {
    let mut fds = vec![
        PollFd::new(session.client_in().as_fd(), PollFlags::POLLIN),
        PollFd::new(session.engine_out().as_fd(), PollFlags::POLLIN),
    ];
    let err_index = session.engine_err().map(|stderr| {
        fds.push(PollFd::new(stderr.as_fd(), PollFlags::POLLIN));
        fds.len() - 1
    });
    let out_index = (!session.outbox().is_empty()).then(|| {
        fds.push(PollFd::new(session.client_out().as_fd(), PollFlags::POLLOUT));
        fds.len() - 1
    });

    let count = match poll(&mut fds, poll_timeout(session)) {
        Ok(count) => count,
        Err(Errno::EINTR) => return Ok(None),
        Err(errno) => return Err(ProxyError::Poll(errno)),
    };
    Ok(Some(Readiness {
        client_in: is_ready(&fds[0], PollFlags::POLLIN),
        engine_out: is_ready(&fds[1], PollFlags::POLLIN),
        engine_err: err_index.is_some_and(|i| is_ready(&fds[i], PollFlags::POLLIN)),
        client_out: out_index.is_some_and(|i| is_ready(&fds[i], PollFlags::POLLOUT)),
        idle: count == 0,
    }))
}

fn iterate(session: &mut Session) -> Result<(), ProxyError> {
    let Some(ready) = wait(session)? else {
        trace!("poll interrupted");
        return Ok(());
    };

    if ready.engine_err {
        session.drain_engine_stderr()?;
    }
    if ready.engine_out {
        session.drain_engine_stdout()?;
    }
    if ready.client_in || session.has_client_line() {
        session.read_client()?;
    }

    if let Err(e) = session.flush_pending() {
        warn!("Failed to apply view changes: {}", e);
    }

    let flags = session.flags();
    if !session.outbox().has_frames()
        && flags.contains(RenderFlags::UPDATE_PENDING)
        && (ready.idle || flags.contains(RenderFlags::FORCE_UPDATE))
    {
        session.auto_render();
    }

    if ready.client_out {
        let delivery = session.deliver()?;
        debug!("Delivery: {:?}", delivery);
    }
    Ok(())
}
