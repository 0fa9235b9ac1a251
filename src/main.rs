//! bwprobe - TCP/UDP bandwidth measurement for iperf- and nuttcp-style peers

use std::io::{self, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bwprobe::client::{Client, ClientConfig};
use bwprobe::config::Config;
use bwprobe::net::AddressFamily;
use bwprobe::output::{
    output_interval_json, output_interval_plain, output_json, output_plain, output_server_event,
    save_json,
};
use bwprobe::protocol::{DEFAULT_PORT, Protocol, TestConfig};
use bwprobe::serve::{DispatchMode, Server, ServerConfig, ServerEvent};
use bwprobe::stats::IntervalSample;
use bwprobe::tcp::DEFAULT_BUFFER_SIZE;

const DEFAULT_UDP_BITRATE: &str = "10M";

/// Initialize logging with optional file output
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("bwprobe={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(io::stderr);

    let Some(file_path) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()?;
        return Ok(());
    };

    let expanded_path = match file_path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(file_path)),
        None => PathBuf::from(file_path),
    };
    if let Some(parent) = expanded_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }

    let file_appender = tracing_appender::rolling::daily(
        expanded_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new(".")),
        expanded_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("bwprobe.log")),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Flushes on drop; the process exits before it would matter.
    std::mem::forget(guard);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

#[derive(Parser)]
#[command(name = "bwprobe")]
#[command(author, version, about = "TCP/UDP bandwidth measurement for iperf- and nuttcp-style peers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL", value_parser = ["bash", "zsh", "fish", "powershell", "elvish"])]
    completions: Option<String>,

    /// Target host for client mode
    #[arg(value_name = "HOST")]
    host: Option<String>,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "BWPROBE_PORT")]
    port: u16,

    /// Test duration
    #[arg(short = 't', long, default_value = "10s", value_parser = parse_duration, env = "BWPROBE_DURATION")]
    time: Duration,

    /// UDP mode
    #[arg(short = 'u', long)]
    udp: bool,

    /// Per-stream UDP bitrate (e.g., 1G, 100M); 0 sends unpaced
    #[arg(short = 'b', long, value_parser = parse_bitrate)]
    bitrate: Option<u64>,

    /// Number of parallel streams
    #[arg(short = 'P', long, default_value_t = 1)]
    parallel: u16,

    /// Bytes per write / datagram buffer (e.g., 128K)
    #[arg(short = 'l', long, value_parser = parse_size)]
    len: Option<usize>,

    /// Stream straight at the peer without a control handshake
    #[arg(long)]
    no_control: bool,

    /// Disable Nagle algorithm
    #[arg(long)]
    tcp_nodelay: bool,

    /// TCP window size (e.g., 512K, 1M)
    #[arg(long, value_parser = parse_size)]
    window: Option<usize>,

    /// Delay between stream starts
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    stagger: Duration,

    #[command(flatten)]
    family: FamilyArgs,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// JSON streaming output (one interval object per line)
    #[arg(long)]
    json_stream: bool,

    /// Quiet mode - suppress interval output, show only summary
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Save the JSON report to a file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Log file path (e.g., "~/.config/bwprobe/bwprobe.log")
    #[arg(long, env = "BWPROBE_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "BWPROBE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(clap::Args, Clone, Copy)]
struct FamilyArgs {
    /// IPv4 only
    #[arg(short = '4', long = "ipv4", conflicts_with_all = ["ipv6", "family"])]
    ipv4: bool,

    /// IPv6 only
    #[arg(short = '6', long = "ipv6", conflicts_with = "family")]
    ipv6: bool,

    /// Address family (ipv4, ipv6, dual)
    #[arg(long, value_parser = parse_family)]
    family: Option<AddressFamily>,
}

impl FamilyArgs {
    fn resolve(self, fallback: Option<&str>) -> AddressFamily {
        if self.ipv4 {
            AddressFamily::V4Only
        } else if self.ipv6 {
            AddressFamily::V6Only
        } else if let Some(family) = self.family {
            family
        } else {
            fallback
                .and_then(|s| s.parse().ok())
                .unwrap_or_default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start server mode
    Serve {
        /// Server port (TCP and UDP)
        #[arg(short, long, default_value_t = DEFAULT_PORT, env = "BWPROBE_PORT")]
        port: u16,

        /// Bind address
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Serve TCP only
        #[arg(long, conflicts_with = "udp_only")]
        tcp_only: bool,

        /// Serve UDP only
        #[arg(long)]
        udp_only: bool,

        /// How data connections find their control session (token, arrival-order)
        #[arg(long, value_parser = parse_dispatch, env = "BWPROBE_DISPATCH")]
        dispatch: Option<DispatchMode>,

        /// Evict UDP senders silent for this long
        #[arg(long, value_parser = parse_duration)]
        session_timeout: Option<Duration>,

        /// Receive buffer size (e.g., 128K)
        #[arg(short = 'l', long, value_parser = parse_size)]
        len: Option<usize>,

        #[command(flatten)]
        family: FamilyArgs,

        /// Suppress per-stream event lines
        #[arg(short = 'q', long)]
        quiet: bool,

        /// Log file path (e.g., "~/.config/bwprobe/bwprobe.log")
        #[arg(long, env = "BWPROBE_LOG_FILE")]
        log_file: Option<String>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long, env = "BWPROBE_LOG_LEVEL")]
        log_level: Option<String>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_family(s: &str) -> Result<AddressFamily, String> {
    s.parse::<AddressFamily>()
}

fn parse_dispatch(s: &str) -> Result<DispatchMode, String> {
    s.parse::<DispatchMode>()
}

/// Bits per second, decimal suffixes.
fn parse_bitrate(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();
    let (num, suffix) = if s.ends_with('G') {
        (s.trim_end_matches('G'), 1_000_000_000f64)
    } else if s.ends_with('M') {
        (s.trim_end_matches('M'), 1_000_000f64)
    } else if s.ends_with('K') {
        (s.trim_end_matches('K'), 1_000f64)
    } else {
        (s.as_str(), 1f64)
    };

    let value = num.parse::<f64>().map_err(|e| e.to_string())?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid bitrate: {}", s));
    }
    Ok((value * suffix).round() as u64)
}

/// Bytes, binary suffixes.
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim().to_uppercase();
    let (num, suffix) = if s.ends_with('G') {
        (s.trim_end_matches('G'), 1024 * 1024 * 1024usize)
    } else if s.ends_with('M') {
        (s.trim_end_matches('M'), 1024 * 1024usize)
    } else if s.ends_with('K') {
        (s.trim_end_matches('K'), 1024usize)
    } else {
        (s.as_str(), 1usize)
    };

    num.parse::<usize>()
        .map_err(|e| e.to_string())?
        .checked_mul(suffix)
        .ok_or_else(|| format!("size too large: {}", s))
}

fn generate_completions(shell: &str) {
    use clap::CommandFactory;
    use clap_complete::{Shell, generate};

    let mut cmd = Cli::command();
    let shell = match shell {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            eprintln!("Unknown shell: {}", shell);
            std::process::exit(1);
        }
    };
    generate(shell, &mut cmd, "bwprobe", &mut io::stdout());
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    if let Some(ref shell) = cli.completions {
        generate_completions(shell);
        return Ok(());
    }

    let file_config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring config file: {:#}", e);
        Config::default()
    });

    match cli.command.take() {
        Some(Commands::Serve {
            port,
            bind,
            tcp_only,
            udp_only,
            dispatch,
            session_timeout,
            len,
            family,
            quiet,
            log_file,
            log_level,
        }) => {
            let server_defaults = &file_config.server;
            init_logging(
                log_file
                    .as_deref()
                    .or(server_defaults.log_file.as_deref()),
                log_level
                    .as_deref()
                    .or(server_defaults.log_level.as_deref()),
            )?;

            let port = if port != DEFAULT_PORT {
                port
            } else {
                server_defaults.port.unwrap_or(DEFAULT_PORT)
            };
            let bind = match bind {
                Some(addr) => Some(addr),
                None => server_defaults
                    .bind
                    .as_deref()
                    .map(str::parse::<IpAddr>)
                    .transpose()
                    .context("invalid bind address in config file")?,
            };
            let buffer_size = match len {
                Some(size) => size,
                None => server_defaults
                    .buffer_size
                    .as_deref()
                    .map(parse_size)
                    .transpose()
                    .map_err(anyhow::Error::msg)?
                    .unwrap_or(DEFAULT_BUFFER_SIZE),
            };

            let config = ServerConfig {
                port,
                bind,
                address_family: family.resolve(server_defaults.address_family.as_deref()),
                tcp: !udp_only && server_defaults.tcp.unwrap_or(true),
                udp: !tcp_only && server_defaults.udp.unwrap_or(true),
                buffer_size,
                dispatch: dispatch.or(server_defaults.dispatch).unwrap_or_default(),
                session_timeout: session_timeout
                    .or(server_defaults.session_timeout_secs.map(Duration::from_secs))
                    .unwrap_or(ServerConfig::default().session_timeout),
                ..Default::default()
            };

            run_server(config, quiet).await?;
        }

        None => {
            let Some(host) = cli.host.clone() else {
                eprintln!("Error: HOST argument required for client mode");
                eprintln!("Usage: bwprobe <HOST> [OPTIONS]");
                eprintln!("       bwprobe serve [OPTIONS]");
                std::process::exit(1);
            };

            let client_defaults = &file_config.client;
            init_logging(
                cli.log_file
                    .as_deref()
                    .or(client_defaults.log_file.as_deref()),
                cli.log_level
                    .as_deref()
                    .or(client_defaults.log_level.as_deref()),
            )?;

            let config = build_client_config(&cli, host, &file_config)?;
            let json = cli.json || client_defaults.json_output.unwrap_or(false);
            run_client(config, json, cli.json_stream, cli.quiet, cli.output).await?;
        }
    }

    Ok(())
}

fn build_client_config(cli: &Cli, host: String, file_config: &Config) -> Result<ClientConfig> {
    let defaults = &file_config.client;

    let protocol = if cli.udp { Protocol::Udp } else { Protocol::Tcp };

    // Config file values apply where the CLI was left at its default
    let duration = if cli.time != Duration::from_secs(10) {
        cli.time
    } else {
        defaults
            .duration_secs
            .map(Duration::from_secs)
            .unwrap_or(cli.time)
    };
    let parallel_streams = if cli.parallel != 1 {
        cli.parallel
    } else {
        defaults.parallel_streams.unwrap_or(cli.parallel)
    };

    let buffer_size = match cli.len {
        Some(len) => len,
        None => defaults
            .buffer_size
            .as_deref()
            .map(parse_size)
            .transpose()
            .map_err(anyhow::Error::msg)?
            .unwrap_or(DEFAULT_BUFFER_SIZE),
    };

    let udp_rate_mbps = if protocol == Protocol::Udp {
        let bits = match cli.bitrate {
            Some(bits) => bits,
            None => parse_bitrate(defaults.bandwidth.as_deref().unwrap_or(DEFAULT_UDP_BITRATE))
                .map_err(anyhow::Error::msg)?,
        };
        Some(bits as f64 / 1_000_000.0)
    } else {
        None
    };

    let window_size = match cli.window {
        Some(size) => Some(size),
        None => defaults
            .window_size
            .as_deref()
            .map(parse_size)
            .transpose()
            .map_err(anyhow::Error::msg)?,
    };

    Ok(ClientConfig {
        test: TestConfig {
            host,
            port: cli.port,
            protocol,
            duration,
            parallel_streams,
            buffer_size,
            udp_rate_mbps,
        },
        control: !(cli.no_control || defaults.no_control.unwrap_or(false)),
        stagger: cli.stagger,
        tcp_nodelay: cli.tcp_nodelay || defaults.tcp_nodelay.unwrap_or(false),
        window_size,
        address_family: cli.family.resolve(defaults.address_family.as_deref()),
        ..Default::default()
    })
}

async fn run_client(
    config: ClientConfig,
    json: bool,
    json_stream: bool,
    quiet: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let client = Client::new(config);

    let stop = client.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping streams");
            stop.stop();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<IntervalSample>();
    let print_handle = tokio::spawn(async move {
        while let Some(sample) = rx.recv().await {
            if quiet {
                continue;
            }
            let line = if json_stream {
                format!("{}\n", output_interval_json(&sample))
            } else if json {
                continue;
            } else {
                output_interval_plain(&sample)
            };
            print!("{}", line);
            let _ = io::stdout().flush();
        }
    });

    let report = client.run(Some(tx)).await?;
    let _ = print_handle.await;

    if json || json_stream {
        println!("{}", output_json(&report));
    } else {
        println!("{}", output_plain(&report));
    }

    if let Some(path) = output {
        save_json(&report, &path)?;
        info!("Results saved to {}", path.display());
    }

    if report.streams.is_empty() && report.cancelled_streams == 0 {
        anyhow::bail!("no stream completed");
    }
    Ok(())
}

async fn run_server(config: ServerConfig, quiet: bool) -> Result<()> {
    let server = Server::new(config);

    let stop = server.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            stop.stop();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let print_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if quiet {
                continue;
            }
            if let Some(line) = output_server_event(&event) {
                println!("{}", line);
            }
        }
    });

    let result = server.run(Some(tx)).await;
    let _ = print_handle.await;
    result?;
    Ok(())
}
