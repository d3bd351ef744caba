//! Incremental message framing
//!
//! A framer turns the raw bytes of one connection into complete protocol
//! units. It appends bytes to the message under construction, asks a
//! protocol-specific [`BoundaryDetector`] where the unit ends, and moves
//! any bytes past that point into a fresh message for the next unit.
//!
//! ```text
//! read() → on_readable(bytes) → current Message ──detect──┐
//!                                   ▲                     │ Complete(end)
//!                                   └── carry [end..] ◄───┤
//!                                                         └→ completed queue
//! ```
//!
//! One framer instance per connection, created by a [`FramerFactory`] at
//! admission.

pub mod http;
pub mod line;

use crate::buffer::{Message, PoolError, SlabPool};
use std::any::Any;
use thiserror::Error;
use tracing::trace;

pub use http::{HttpDetector, HttpHeaders, HttpMethod};
pub use line::{LineDetector, LineInfo};

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Input violates the protocol; the connection must be closed
    #[error("malformed input: {0}")]
    Malformed(String),
}

impl FrameError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, FrameError::Pool(e) if e.is_exhausted())
    }
}

/// Outcome of scanning a buffer for the end of one protocol unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// More bytes are needed
    Incomplete,
    /// The unit occupies `bytes[..end]`
    Complete(usize),
    /// The bytes can never form a valid unit
    Malformed(String),
}

/// Protocol-specific search for the end of a unit
pub trait BoundaryDetector: Send {
    /// Metadata recorded for each completed unit
    type Meta: Any + Send + Default;

    /// Scan `bytes` (a whole unit prefix, starting at its first byte)
    fn detect(&mut self, bytes: &[u8], meta: &mut Self::Meta) -> Detection;
}

/// Per-connection assembly of raw bytes into complete messages
pub trait MessageFramer: Send {
    /// Append freshly read bytes and split off every completed unit
    ///
    /// Call with an empty slice to retry a split that was deferred
    /// because the pool had no slot for the next unit.
    fn on_readable(&mut self, pool: &mut SlabPool, data: &[u8]) -> Result<(), FrameError>;

    /// Bytes that can be accepted now without a slot the pool lacks
    ///
    /// Zero means "stop reading this connection until slots free up".
    fn read_budget(&mut self, pool: &mut SlabPool) -> Result<usize, FrameError>;

    /// Completed messages, in the order their boundaries were found
    fn drain_completed(&mut self) -> std::vec::Drain<'_, Message>;

    /// True while a found boundary waits for a free slot
    fn is_stalled(&self) -> bool;

    /// Return every held slot to the pool
    fn reclaim(&mut self, pool: &mut SlabPool) -> Result<(), PoolError>;
}

/// Creates one framer per admitted connection
pub trait FramerFactory: Send {
    fn create(&self) -> Box<dyn MessageFramer>;
}

impl<F> FramerFactory for F
where
    F: Fn() -> Box<dyn MessageFramer> + Send,
{
    fn create(&self) -> Box<dyn MessageFramer> {
        self()
    }
}

/// Factory that clones a configured detector into each new framer
#[derive(Debug, Clone)]
pub struct DetectorFactory<D> {
    prototype: D,
}

impl<D> DetectorFactory<D>
where
    D: BoundaryDetector + Clone + 'static,
{
    pub fn new(prototype: D) -> Self {
        Self { prototype }
    }
}

impl<D> FramerFactory for DetectorFactory<D>
where
    D: BoundaryDetector + Clone + 'static,
{
    fn create(&self) -> Box<dyn MessageFramer> {
        Box::new(DetectingFramer::new(self.prototype.clone()))
    }
}

/// [`MessageFramer`] driven by any [`BoundaryDetector`]
///
/// The message under construction is acquired lazily, so admission never
/// fails on an exhausted pool; the connection simply is not read.
pub struct DetectingFramer<D: BoundaryDetector> {
    detector: D,
    current: Option<Message>,
    completed: Vec<Message>,
    stalled: bool,
}

impl<D: BoundaryDetector> DetectingFramer<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            current: None,
            completed: Vec::new(),
            stalled: false,
        }
    }

    /// The message under construction, if any
    pub fn current(&self) -> Option<&Message> {
        self.current.as_ref()
    }

    fn ensure_current(&mut self, pool: &mut SlabPool) -> Result<&mut Message, PoolError> {
        let message = match self.current.take() {
            Some(message) => message,
            None => pool.acquire()?,
        };
        Ok(self.current.insert(message))
    }

    /// Split completed units off the current message until none is left
    fn scan(&mut self, pool: &mut SlabPool) -> Result<(), FrameError> {
        loop {
            let Some(current) = self.current.as_ref() else {
                return Ok(());
            };
            if current.is_empty() {
                self.stalled = false;
                return Ok(());
            }

            let mut meta = D::Meta::default();
            let end = match self.detector.detect(pool.bytes(current), &mut meta) {
                Detection::Incomplete => {
                    self.stalled = false;
                    return Ok(());
                }
                Detection::Malformed(reason) => return Err(FrameError::Malformed(reason)),
                Detection::Complete(end) => end,
            };
            if end == 0 || end > current.len() {
                return Err(FrameError::Malformed(format!(
                    "boundary {} outside message of {} bytes",
                    end,
                    current.len()
                )));
            }

            if end == current.len() {
                // Nothing to carry; the next unit's slot is taken on demand
                if let Some(mut done) = self.current.take() {
                    trace!(len = end, "Unit complete");
                    done.set_metadata(meta);
                    self.completed.push(done);
                }
                self.stalled = false;
                return Ok(());
            }

            let mut next = match pool.acquire() {
                Ok(next) => next,
                Err(e) if e.is_exhausted() => {
                    self.stalled = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = next.carry_forward(pool, current, end) {
                pool.release(next)?;
                if e.is_exhausted() {
                    self.stalled = true;
                    return Ok(());
                }
                return Err(e.into());
            }

            if let Some(mut done) = self.current.replace(next) {
                trace!(len = end, carried = done.len() - end, "Unit complete");
                done.truncate(end);
                done.set_metadata(meta);
                self.completed.push(done);
            }
            self.stalled = false;
        }
    }
}

impl<D: BoundaryDetector> MessageFramer for DetectingFramer<D> {
    fn on_readable(&mut self, pool: &mut SlabPool, data: &[u8]) -> Result<(), FrameError> {
        if !data.is_empty() {
            let current = self.ensure_current(pool)?;
            current.append(pool, data)?;
        }
        self.scan(pool)
    }

    fn read_budget(&mut self, pool: &mut SlabPool) -> Result<usize, FrameError> {
        if self.stalled {
            self.scan(pool)?;
            if self.stalled {
                return Ok(0);
            }
        }

        let current = match self.ensure_current(pool) {
            Ok(current) => current,
            Err(e) if e.is_exhausted() => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if current.len() < current.capacity() {
            return Ok(current.capacity() - current.len());
        }

        match pool.grow(current) {
            Ok(()) => Ok(current.capacity() - current.len()),
            Err(e) if e.is_exhausted() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn drain_completed(&mut self) -> std::vec::Drain<'_, Message> {
        self.completed.drain(..)
    }

    fn is_stalled(&self) -> bool {
        self.stalled
    }

    fn reclaim(&mut self, pool: &mut SlabPool) -> Result<(), PoolError> {
        let mut result = Ok(());
        for message in self.current.take().into_iter().chain(self.completed.drain(..)) {
            if let Err(e) = pool.release(message) {
                result = Err(e);
            }
        }
        self.stalled = false;
        result
    }
}
