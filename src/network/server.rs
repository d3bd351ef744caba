//! Server wiring: one accept thread, one processing thread

use super::accept::{Acceptor, Admission};
use super::outbound::{MessageProcessor, OutboundSender};
use super::processor::SocketProcessor;
use crate::buffer::SocketId;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::framing::FramerFactory;
use crossbeam_channel::Sender;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::info;

pub struct Server {
    config: EngineConfig,
    factory: Box<dyn FramerFactory>,
    processor: Box<dyn MessageProcessor>,
}

impl Server {
    pub fn new(
        config: EngineConfig,
        factory: impl FramerFactory + 'static,
        processor: impl MessageProcessor + 'static,
    ) -> Self {
        Self {
            config,
            factory: Box::new(factory),
            processor: Box::new(processor),
        }
    }

    /// Bind the listener and spawn both threads
    pub fn start(self) -> Result<ServerHandle> {
        self.config.validate()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let (admissions, inbound) =
            crossbeam_channel::bounded(self.config.server.inbound_queue_capacity);

        let acceptor = Acceptor::bind(
            self.config.server.bind_addr,
            admissions.clone(),
            shutdown.clone(),
            self.config.server.accept_poll_interval(),
        )?;
        let local_addr = acceptor.local_addr()?;

        let processor = SocketProcessor::new(
            inbound,
            self.factory,
            self.processor,
            &self.config,
            shutdown.clone(),
        )?;
        let outbound = processor.outbound_sender();

        let accept_thread = thread::Builder::new()
            .name("photonwire-accept".into())
            .spawn(move || acceptor.run())?;
        let process_thread = match thread::Builder::new()
            .name("photonwire-loop".into())
            .spawn(move || processor.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                shutdown.store(true, Ordering::Release);
                accept_thread.join().ok();
                return Err(e.into());
            }
        };

        info!(%local_addr, "Server started");
        Ok(ServerHandle {
            local_addr,
            admissions,
            outbound,
            shutdown,
            threads: vec![accept_thread, process_thread],
        })
    }
}

/// Running server; dropping it signals shutdown without waiting
pub struct ServerHandle {
    local_addr: SocketAddr,
    admissions: Sender<Admission>,
    outbound: OutboundSender,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sender into the admission queue
    pub fn admissions(&self) -> Sender<Admission> {
        self.admissions.clone()
    }

    pub fn outbound(&self) -> OutboundSender {
        self.outbound.clone()
    }

    /// Ask the processor to close a connection
    pub fn close(&self, id: SocketId) -> Result<()> {
        self.admissions
            .send(Admission::Close(id))
            .map_err(|_| Error::Internal("socket processor has stopped".into()))
    }

    /// Stop both threads and wait for them
    pub fn shutdown(self) -> Result<()> {
        info!(local_addr = %self.local_addr, "Shutting down server");
        self.shutdown.store(true, Ordering::Release);
        self.wait()
    }

    /// Block until both threads exit
    pub fn wait(mut self) -> Result<()> {
        let mut result = Ok(());
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(_) => result = Err(Error::Internal(format!("{} thread panicked", name))),
            }
        }
        result
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
