use crate::config::{BackendKind, PortalConfig};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Share GPU memory between processes through an exported memory handle
#[derive(Parser, Debug, PartialEq)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand
    #[clap(subcommand)]
    pub command: Command,

    /// Config file path
    #[clap(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long)]
    pub log_level: Option<String>,

    /// Enable debug logging (same as --log-level=debug)
    #[clap(short, long)]
    pub verbose: bool,
}

/// Options shared by producer and consumer
#[derive(Args, Debug, PartialEq, Clone, Default)]
pub struct RegionArgs {
    /// Rendezvous socket path
    #[clap(short, long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Region size in bytes
    #[clap(long)]
    pub size: Option<u64>,

    /// Graphics backend
    #[clap(short, long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Print the whole region after the exchange
    #[clap(long)]
    pub dump: bool,
}

/// Commands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Allocate and export a region, then write into it for one consumer
    Produce {
        #[clap(flatten)]
        region: RegionArgs,

        /// Comma separated bytes to write
        #[clap(short, long, default_value = "1,1,1,1,1")]
        pattern: String,

        /// Offset of the write
        #[clap(long, default_value = "0")]
        offset: u64,

        /// Read the region back after the consumer is done
        #[clap(long)]
        read_back: bool,
    },

    /// Import a producer's region and read what it writes
    Consume {
        #[clap(flatten)]
        region: RegionArgs,

        /// Extra attempts when no producer is listening yet
        #[clap(long, default_value = "0")]
        connect_retries: u32,
    },

    /// Run producer and consumer in one process with separate contexts
    Demo {
        #[clap(flatten)]
        region: RegionArgs,

        /// Comma separated bytes to write
        #[clap(short, long, default_value = "1,1,1,1,1")]
        pattern: String,
    },

    /// Create a default config file
    Init {
        /// Output path
        #[clap(default_value = "memory-portal.toml")]
        path: PathBuf,
    },
}

impl Cli {
    /// Effective log level: `--verbose`, then `--log-level`, then the config
    pub fn effective_log_level(&self, config: &PortalConfig) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level.clone().unwrap_or_else(|| config.log_level.clone())
        }
    }
}

impl RegionArgs {
    /// Overlay command line values on `config`
    pub fn apply(&self, config: &PortalConfig) -> PortalConfig {
        let mut config = config.clone();
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(size) = self.size {
            config.region_size = size;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        config
    }
}

/// Parse `"1,2,0x10"` into bytes
pub fn parse_pattern(pattern: &str) -> Result<Vec<u8>> {
    pattern
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => s.parse::<u8>(),
            };
            parsed.with_context(|| format!("Invalid byte in pattern: {:?}", s))
        })
        .collect::<Result<Vec<u8>>>()
        .and_then(|bytes| {
            if bytes.is_empty() {
                Err(anyhow!("Pattern is empty"))
            } else {
                Ok(bytes)
            }
        })
}

/// Hex dump, 16 bytes per line
pub fn format_region(bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            format!("{:08x}  {}", i * 16, hex.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_produce() {
        let cli = Cli::parse_from([
            "memory-portal",
            "-v",
            "produce",
            "--socket",
            "/tmp/test_socket",
            "--size",
            "4096",
            "--backend",
            "host",
            "--read-back",
        ]);

        assert!(cli.verbose);
        match cli.command {
            Command::Produce { region, pattern, offset, read_back } => {
                assert_eq!(region.socket, Some(PathBuf::from("/tmp/test_socket")));
                assert_eq!(region.size, Some(4096));
                assert_eq!(region.backend, Some(BackendKind::Host));
                assert_eq!(pattern, "1,1,1,1,1");
                assert_eq!(offset, 0);
                assert!(read_back);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_region_args_override_config() {
        let config = PortalConfig::default();
        let args = RegionArgs {
            size: Some(2048),
            ..RegionArgs::default()
        };

        let applied = args.apply(&config);
        assert_eq!(applied.region_size, 2048);
        assert_eq!(applied.socket_path, config.socket_path);
    }

    #[test]
    fn test_effective_log_level() {
        let config = PortalConfig::default();
        let cli = Cli::parse_from(["memory-portal", "--log-level", "warn", "init"]);
        assert_eq!(cli.effective_log_level(&config), "warn");

        let cli = Cli::parse_from(["memory-portal", "init"]);
        assert_eq!(cli.effective_log_level(&config), "info");
    }

    #[rstest]
    #[case("1,1,1,1,1", vec![1, 1, 1, 1, 1])]
    #[case(" 0x10, 255 ,0", vec![16, 255, 0])]
    #[case("7", vec![7])]
    fn test_parse_pattern(#[case] input: &str, #[case] expected: Vec<u8>) {
        assert_eq!(parse_pattern(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("256")]
    #[case("1,x")]
    fn test_parse_pattern_rejects(#[case] input: &str) {
        assert!(parse_pattern(input).is_err());
    }

    #[test]
    fn test_format_region() {
        let dump = format_region(&[1; 20]);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  01 01"));
        assert_eq!(lines[1], "00000010  01 01 01 01");
    }
}
