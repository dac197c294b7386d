use anyhow::{Context, Result};
use clap::Parser;
use memory_portal::cli::{format_region, parse_pattern, Cli, Command};
use memory_portal::config::{BackendKind, PortalConfig};
use memory_portal::logging::init_logging;
use memory_portal::demo::run_demo;
use memory_portal::{ConsumerReport, ConsumerSession, ProducerSession, SessionOptions};
use memory_portal_core::GraphicsContext;
use memory_portal_shared_memory::HostContext;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[cfg(feature = "vulkan")]
use memory_portal_vulkan::{VulkanConfig, VulkanContext};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PortalConfig::load(cli.config.as_deref())?;
    init_logging(&cli.effective_log_level(&config))?;

    match &cli.command {
        Command::Produce {
            region,
            pattern,
            offset,
            read_back,
        } => {
            let config = region.apply(&config);
            let payload = parse_pattern(pattern)?;
            info!("Producing on {:?} with the {} backend", config.socket_path, config.backend);

            match config.backend {
                BackendKind::Host => produce(&Arc::new(HostContext::new()), &config, *offset, &payload, *read_back, region.dump),
                #[cfg(feature = "vulkan")]
                BackendKind::Vulkan => produce(&vulkan_context(&config)?, &config, *offset, &payload, *read_back, region.dump),
                #[cfg(not(feature = "vulkan"))]
                BackendKind::Vulkan => anyhow::bail!("Built without Vulkan support"),
            }
        }

        Command::Consume { region, connect_retries } => {
            let config = region.apply(&config);
            info!("Consuming from {:?} with the {} backend", config.socket_path, config.backend);

            match config.backend {
                BackendKind::Host => consume(&Arc::new(HostContext::new()), &config, *connect_retries, region.dump),
                #[cfg(feature = "vulkan")]
                BackendKind::Vulkan => consume(&vulkan_context(&config)?, &config, *connect_retries, region.dump),
                #[cfg(not(feature = "vulkan"))]
                BackendKind::Vulkan => anyhow::bail!("Built without Vulkan support"),
            }
        }

        Command::Demo { region, pattern } => {
            let config = region.apply(&config);
            let payload = parse_pattern(pattern)?;

            match config.backend {
                BackendKind::Host => demo(
                    || Ok(HostContext::new()),
                    || Ok(HostContext::new()),
                    &config,
                    &payload,
                    region.dump,
                ),
                #[cfg(feature = "vulkan")]
                BackendKind::Vulkan => {
                    let vulkan_config = VulkanConfig {
                        validation_layers: config.validation_layers,
                    };
                    let consumer_config = vulkan_config.clone();
                    demo(
                        move || Ok(VulkanContext::new(&vulkan_config)?),
                        move || Ok(VulkanContext::new(&consumer_config)?),
                        &config,
                        &payload,
                        region.dump,
                    )
                }
                #[cfg(not(feature = "vulkan"))]
                BackendKind::Vulkan => anyhow::bail!("Built without Vulkan support"),
            }
        }

        Command::Init { path } => {
            PortalConfig::default().save_to_file(path)?;
            println!("Config file created at: {}", path.display());
            Ok(())
        }
    }
}

#[cfg(feature = "vulkan")]
fn vulkan_context(config: &PortalConfig) -> Result<Arc<VulkanContext>> {
    let context = VulkanContext::new(&VulkanConfig {
        validation_layers: config.validation_layers,
    })
    .context("Failed to initialize Vulkan")?;
    info!("Using Vulkan device {}", context.device_name());
    Ok(Arc::new(context))
}

fn session_options(config: &PortalConfig) -> SessionOptions {
    SessionOptions::new(&config.socket_path, config.region_size).with_handshake(config.handshake_options())
}

fn produce<C: GraphicsContext>(
    context: &Arc<C>,
    config: &PortalConfig,
    offset: u64,
    payload: &[u8],
    read_back: bool,
    dump: bool,
) -> Result<()> {
    let producer = ProducerSession::new(context, session_options(config)).context("Failed to allocate shared region")?;
    let report = producer
        .run(offset, payload, read_back)
        .context("Producer session failed")?;

    println!(
        "Wrote {} bytes at offset {} (crc {:#010x})",
        report.range.len, report.range.offset, report.range.checksum
    );

    if let Some(region) = report.read_back {
        let start = report.range.offset as usize;
        let end = start + report.range.len as usize;
        println!("Read back: {:?}", &region[start..end]);
        if dump {
            println!("{}", format_region(&region));
        }
    }
    Ok(())
}

fn consume<C: GraphicsContext>(context: &Arc<C>, config: &PortalConfig, retries: u32, dump: bool) -> Result<()> {
    let session = ConsumerSession::new(context, session_options(config));

    let mut attempt = 0;
    let report = loop {
        match session.run() {
            Ok(report) => break report,
            Err(e) if e.is_session_retryable() && attempt < retries => {
                attempt += 1;
                warn!("Session attempt {} failed ({:?}: {}), retrying", attempt, e.category(), e);
                thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => return Err(e).context("Consumer session failed"),
        }
    };

    print_consumed(&report, dump);
    Ok(())
}

/// Producer and consumer on two threads, each with its own context
fn demo<P, PF, C, CF>(producer: PF, consumer: CF, config: &PortalConfig, payload: &[u8], dump: bool) -> Result<()>
where
    P: GraphicsContext,
    PF: FnOnce() -> Result<P>,
    C: GraphicsContext + 'static,
    CF: FnOnce() -> Result<C> + Send + 'static,
{
    let report = run_demo(producer, consumer, session_options(config), payload)?;

    print_consumed(&report.consumed, dump);
    println!("Demo succeeded: {} bytes shared", payload.len());
    Ok(())
}

fn print_consumed(report: &ConsumerReport, dump: bool) {
    println!(
        "Read {} bytes at offset {}: {:?}",
        report.range.len, report.range.offset, report.data
    );
    if dump {
        println!("{}", format_region(&report.region));
    }
}
