//! Listening socket and admission queue
//!
//! The acceptor runs on its own thread, accepts connections as they
//! arrive and hands them to the socket processor through a bounded
//! channel. A full channel makes the acceptor wait, which leaves further
//! connections in the listen backlog.

use crate::buffer::SocketId;
use crate::error::{Error, Result};
use crate::metrics;
use crossbeam_channel::{SendTimeoutError, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER: Token = Token(0);

/// Work item for the socket processor
#[derive(Debug)]
pub enum Admission {
    /// Newly accepted, non-blocking connection
    Open(TcpStream),
    /// Close a connection by id
    Close(SocketId),
}

pub struct Acceptor {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    queue: Sender<Admission>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    /// Accept failed with connections possibly left in the backlog
    retry_accept: bool,
}

impl Acceptor {
    pub fn bind(
        addr: SocketAddr,
        queue: Sender<Admission>,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(128),
            queue,
            shutdown,
            poll_interval,
            retry_accept: false,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until shutdown is requested or the processor goes away
    pub fn run(mut self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Accepting connections");

        while !self.shutdown.load(Ordering::Acquire) {
            self.poll_once()?;
        }

        info!("Acceptor stopped");
        Ok(())
    }

    /// Wait up to one poll interval, then accept what is pending
    ///
    /// Readiness is edge-triggered, so after a failed accept the backlog
    /// is retried on the next pass instead of waiting for a new event.
    fn poll_once(&mut self) -> Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, Some(self.poll_interval)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }
        let ready = self.events.iter().any(|event| event.token() == LISTENER);
        if ready || std::mem::take(&mut self.retry_accept) {
            self.accept_pending()?;
        }
        Ok(())
    }

    /// Drain the listen backlog
    fn accept_pending(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    metrics::CONNECTIONS_ACCEPTED.inc();
                    if !self.admit(Admission::Open(stream))? {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Typically descriptor exhaustion; retry after one poll interval
                    warn!(error = %e, "Accept failed");
                    self.retry_accept = true;
                    return Ok(());
                }
            }
        }
    }

    /// Block until the processor has room, or shutdown. Returns false on shutdown.
    fn admit(&self, admission: Admission) -> Result<bool> {
        let mut pending = admission;
        loop {
            match self.queue.send_timeout(pending, self.poll_interval) {
                Ok(()) => return Ok(true),
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        return Ok(false);
                    }
                    pending = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(Error::Internal("admission queue closed".into()))
                }
            }
        }
    }
}
