//! Producer and consumer halves of one sharing session
//!
//! The producer owns the exportable allocation and the rendezvous path. The
//! consumer imports the handle into its own context. After the handle both
//! sides follow the signal sequence `Mapped`, `Ready`, `ReadComplete`, so the
//! consumer never reads before the producer's flush has completed.

use memory_portal_core::{
    acquire, allocate, export_handle, import_handle, publish, DeviceMemoryAllocation, FlushedRange, GraphicsContext,
    MemoryPropertyFlags, ProtocolViolation, Result,
};
use memory_portal_network::{HandshakeConnection, HandshakeOptions, HandshakeServer, Signal, SignalKind, SignalLink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Parameters shared by both halves
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Rendezvous path
    pub socket_path: PathBuf,
    /// Region size; the consumer must use the producer's value
    pub region_size: u64,
    /// Properties the memory type must have
    pub required: MemoryPropertyFlags,
    /// Handshake timeouts
    pub handshake: HandshakeOptions,
}

impl SessionOptions {
    pub fn new(socket_path: impl Into<PathBuf>, region_size: u64) -> Self {
        Self {
            socket_path: socket_path.into(),
            region_size,
            required: MemoryPropertyFlags::shareable(),
            handshake: HandshakeOptions::default(),
        }
    }

    pub fn with_required(mut self, required: MemoryPropertyFlags) -> Self {
        self.required = required;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeOptions) -> Self {
        self.handshake = handshake;
        self
    }
}

/// What the producer saw
#[derive(Debug, Clone)]
pub struct ProducerReport {
    /// Range announced to the consumer
    pub range: FlushedRange,
    /// Region contents after mapping, before the write
    pub snapshot: Vec<u8>,
    /// Region contents read back after the consumer finished
    pub read_back: Option<Vec<u8>>,
}

/// What the consumer saw
#[derive(Debug, Clone)]
pub struct ConsumerReport {
    /// Range announced by the producer
    pub range: FlushedRange,
    /// Bytes of the announced range
    pub data: Vec<u8>,
    /// Whole region after invalidation
    pub region: Vec<u8>,
}

/// Writer side
pub struct ProducerSession<C: GraphicsContext> {
    allocation: DeviceMemoryAllocation<C>,
    options: SessionOptions,
}

impl<C: GraphicsContext> ProducerSession<C> {
    /// Allocate the exportable region
    pub fn new(context: &Arc<C>, options: SessionOptions) -> Result<Self> {
        let allocation = allocate(context, options.region_size, options.required, true)?;
        Ok(Self { allocation, options })
    }

    pub fn allocation(&self) -> &DeviceMemoryAllocation<C> {
        &self.allocation
    }

    /// Bind the rendezvous path and serve one consumer
    pub fn run(&self, offset: u64, payload: &[u8], read_back: bool) -> Result<ProducerReport> {
        let server = HandshakeServer::bind(&self.options.socket_path)?;
        self.serve(&server, offset, payload, read_back)
    }

    /// Serve one consumer on an already bound server
    pub fn serve(&self, server: &HandshakeServer, offset: u64, payload: &[u8], read_back: bool) -> Result<ProducerReport> {
        self.serve_with(server, &self.options.handshake, offset, payload, read_back)
    }

    /// Like [`ProducerSession::serve`], with explicit handshake timeouts
    pub fn serve_with(
        &self,
        server: &HandshakeServer,
        handshake: &HandshakeOptions,
        offset: u64,
        payload: &[u8],
        read_back: bool,
    ) -> Result<ProducerReport> {
        let handle = export_handle(&self.allocation)?;

        debug!("Waiting for consumer on {:?}", server.path());
        let connection = server.accept(handshake)?;
        connection.send_handle(handle)?;
        let mut link = connection.into_signal_link();

        let mut view = self.allocation.map()?;
        let snapshot = view.as_slice().to_vec();

        link.expect(SignalKind::Mapped)?;
        let range = publish(&mut view, offset, payload)?;
        link.send(Signal::Ready(range))?;
        info!("Published {} bytes at offset {}", range.len, range.offset);

        link.expect(SignalKind::ReadComplete)?;
        info!("Consumer finished reading");

        let read_back = if read_back {
            view.invalidate()?;
            Some(view.as_slice().to_vec())
        } else {
            None
        };

        Ok(ProducerReport {
            range,
            snapshot,
            read_back,
        })
    }
}

/// Reader side
pub struct ConsumerSession<C: GraphicsContext> {
    context: Arc<C>,
    options: SessionOptions,
}

impl<C: GraphicsContext> ConsumerSession<C> {
    pub fn new(context: &Arc<C>, options: SessionOptions) -> Self {
        Self {
            context: Arc::clone(context),
            options,
        }
    }

    /// Connect, import the region and read what the producer publishes
    pub fn run(&self) -> Result<ConsumerReport> {
        let connection = HandshakeConnection::connect(&self.options.socket_path, &self.options.handshake)?;
        let handle = connection.receive_handle()?;

        let allocation = import_handle(&self.context, handle, self.options.region_size, self.options.required)?;
        let view = allocation.map()?;

        let mut link = connection.into_signal_link();
        link.send(Signal::Mapped)?;

        let range = expect_ready(&mut link)?;
        let data = acquire(&view, &range)?;
        info!("Read {} bytes at offset {}", range.len, range.offset);

        view.invalidate()?;
        let region = view.as_slice().to_vec();
        link.send(Signal::ReadComplete)?;

        Ok(ConsumerReport { range, data, region })
    }
}

fn expect_ready(link: &mut SignalLink) -> Result<FlushedRange> {
    match link.expect(SignalKind::Ready)? {
        Signal::Ready(range) => Ok(range),
        other => Err(ProtocolViolation::UnexpectedSignal {
            expected: SignalKind::Ready.to_string(),
            received: other.kind().to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_portal_core::{ChannelError, PortalError, TransferFault};
    use memory_portal_shared_memory::HostContext;
    use std::thread;
    use std::time::Duration;

    fn options(dir: &tempfile::TempDir) -> SessionOptions {
        SessionOptions::new(dir.path().join("portal.sock"), 1024)
            .with_handshake(HandshakeOptions::default().with_io_timeout(Duration::from_secs(10)))
    }

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(&dir);
        let server = HandshakeServer::bind(&options.socket_path).unwrap();

        let consumer_options = options.clone();
        let consumer = thread::spawn(move || {
            let context = Arc::new(HostContext::new());
            ConsumerSession::new(&context, consumer_options).run()
        });

        let context = Arc::new(HostContext::new());
        let producer = ProducerSession::new(&context, options).unwrap();
        let produced = producer.serve(&server, 0, &[1, 1, 1, 1, 1], true).unwrap();
        let consumed = consumer.join().unwrap().unwrap();

        assert_eq!(consumed.range, produced.range);
        assert_eq!(consumed.data, vec![1; 5]);
        assert_eq!(&consumed.region[5..], &produced.snapshot[5..]);
        assert_eq!(produced.read_back.unwrap(), consumed.region);
    }

    #[test]
    fn test_consumer_size_mismatch_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(&dir);
        let server = HandshakeServer::bind(&options.socket_path).unwrap();

        let mut consumer_options = options.clone();
        consumer_options.region_size = 2048;
        let consumer = thread::spawn(move || {
            let context = Arc::new(HostContext::new());
            ConsumerSession::new(&context, consumer_options).run()
        });

        let context = Arc::new(HostContext::new());
        let producer = ProducerSession::new(&context, options).unwrap();
        let produced = producer.serve(&server, 0, &[1, 1, 1, 1, 1], false);

        let consumed = consumer.join().unwrap();
        assert!(matches!(
            consumed,
            Err(PortalError::Protocol(ProtocolViolation::SizeMismatch { declared: 1024, requested: 2048 }))
        ));
        assert!(matches!(
            produced,
            Err(PortalError::Channel(ChannelError::TransferFailed(TransferFault::Closed)))
        ));
    }

    #[test]
    fn test_consumer_without_producer() {
        let dir = tempfile::tempdir().unwrap();
        let context = Arc::new(HostContext::new());

        let err = ConsumerSession::new(&context, options(&dir)).run().unwrap_err();
        assert!(err.is_session_retryable());
    }
}
