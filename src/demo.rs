//! Producer and consumer in one process, each with its own context
//!
//! The producer waits for the consumer in short accept slices. Between
//! slices it checks whether the consumer thread has already finished, so a
//! consumer that fails before connecting ends the demo instead of leaving
//! the producer blocked in `accept`.

use crate::session::{ConsumerReport, ConsumerSession, ProducerReport, ProducerSession, SessionOptions};
use anyhow::{anyhow, bail, Context, Result};
use memory_portal_core::{ChannelError, GraphicsContext, PortalError, TransferFault};
use memory_portal_network::HandshakeServer;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bound on each accept attempt while the consumer is starting
pub const ACCEPT_SLICE: Duration = Duration::from_millis(100);

/// Reports of both halves
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub produced: ProducerReport,
    pub consumed: ConsumerReport,
}

/// Run one exchange of `payload` between two contexts built by the factories.
///
/// The consumer context is created on its own thread. A configured accept
/// timeout still bounds the whole wait for the consumer.
pub fn run_demo<P, PF, C, CF>(
    producer_factory: PF,
    consumer_factory: CF,
    options: SessionOptions,
    payload: &[u8],
) -> Result<DemoReport>
where
    P: GraphicsContext,
    PF: FnOnce() -> Result<P>,
    C: GraphicsContext + 'static,
    CF: FnOnce() -> Result<C> + Send + 'static,
{
    let server = HandshakeServer::bind(&options.socket_path).context("Failed to bind rendezvous path")?;

    let consumer_options = options.clone();
    let consumer = thread::spawn(move || -> Result<ConsumerReport> {
        let context = Arc::new(consumer_factory().context("Failed to create consumer context")?);
        Ok(ConsumerSession::new(&context, consumer_options).run()?)
    });

    let context = Arc::new(producer_factory().context("Failed to create producer context")?);
    let producer = ProducerSession::new(&context, options.clone()).context("Failed to allocate shared region")?;

    let deadline = options.handshake.accept_timeout.map(|timeout| Instant::now() + timeout);
    let sliced = options.handshake.clone().with_accept_timeout(ACCEPT_SLICE);

    let produced = loop {
        match producer.serve_with(&server, &sliced, 0, payload, true) {
            Err(PortalError::Channel(ChannelError::TransferFailed(TransferFault::TimedOut { .. })))
                if !consumer.is_finished() && deadline.map_or(true, |deadline| Instant::now() < deadline) =>
            {
                debug!("Consumer not connected yet, waiting");
            }
            other => break other,
        }
    };

    let consumed = consumer.join().map_err(|_| anyhow!("Consumer thread panicked"))?;

    // A consumer failure is the root cause of whatever the producer saw
    let consumed = consumed.context("Consumer session failed")?;
    let produced = match produced {
        Ok(report) => report,
        Err(e) => {
            warn!("Producer failed ({:?}): {}", e.category(), e);
            return Err(e).context("Producer session failed");
        }
    };

    if consumed.data != payload {
        bail!("Consumer read {:?}, producer wrote {:?}", consumed.data, payload);
    }
    if produced.read_back.as_deref() != Some(consumed.region.as_slice()) {
        bail!("Producer read back differs from the consumer's view");
    }

    Ok(DemoReport { produced, consumed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_portal_shared_memory::HostContext;

    fn options(dir: &tempfile::TempDir) -> SessionOptions {
        SessionOptions::new(dir.path().join("portal.sock"), 1024)
    }

    #[test]
    fn test_demo_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let report = run_demo(|| Ok(HostContext::new()), || Ok(HostContext::new()), options(&dir), &[1, 1, 1, 1, 1])
            .unwrap();

        assert_eq!(report.consumed.data, vec![1; 5]);
        assert_eq!(report.produced.read_back.unwrap(), report.consumed.region);
        assert!(!dir.path().join("portal.sock").exists());
    }

    #[test]
    fn test_failed_consumer_ends_unbounded_demo() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(&dir);
        assert!(options.handshake.accept_timeout.is_none());

        let started = Instant::now();
        let err = run_demo(
            || Ok(HostContext::new()),
            || -> Result<HostContext> { bail!("no device") },
            options,
            &[1, 1, 1, 1, 1],
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("no device"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_configured_accept_timeout_still_applies() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(&dir).with_handshake(
            memory_portal_network::HandshakeOptions::default().with_accept_timeout(Duration::from_millis(300)),
        );

        // Consumer that never connects but stays alive past the bound
        let err = run_demo(
            || Ok(HostContext::new()),
            || -> Result<HostContext> {
                thread::sleep(Duration::from_secs(1));
                bail!("too late")
            },
            options,
            &[1],
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("too late"));
    }
}
