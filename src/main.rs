//! MotorLink - Motor controller console
//!
//! Command-line front-end for sending motor commands and watching telemetry.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use motorlink::config::{self, Config};
use motorlink::console::MotorConsole;
use motorlink::protocol::{self, MotorMask, Telemetry, TelemetryRecord};
use motorlink::simulator::{Simulator, SimulatorConfig};

/// MotorLink - UDP motor controller console
#[derive(Parser)]
#[command(name = "motorlink")]
#[command(author = "MotorLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Send commands to motor nodes and watch their telemetry", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Controller IP address (overrides config)
    #[arg(short, long, global = true)]
    remote: Option<String>,

    /// Controller port (overrides config)
    #[arg(long, global = true)]
    remote_port: Option<u16>,

    /// Local telemetry port (overrides config)
    #[arg(long, global = true)]
    local_port: Option<u16>,

    /// Talk to an in-process simulated controller instead of the hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a command to a single motor
    Send {
        /// Motor address
        #[arg(short, long)]
        address: u8,

        #[command(subcommand)]
        action: MotorAction,
    },

    /// Move several motors together
    Sync {
        /// Selected motors as a binary string (bit k = motor k+1)
        #[arg(short, long)]
        selection: String,

        /// Directions as a binary string
        #[arg(short, long, default_value = "0000000")]
        direction: String,

        /// Sync speed (0-1024)
        #[arg(long)]
        speed: u16,

        /// Run the selected motors against their given direction
        #[arg(long)]
        reverse: bool,
    },

    /// Stop every motor in a sync move
    SyncStop,

    /// Run a configured multi-motor preset
    Preset {
        /// Group index in the config
        index: usize,

        /// Reverse the selected motors
        #[arg(long)]
        reverse: bool,
    },

    /// Print telemetry until interrupted
    Listen {
        /// Print one JSON object per record
        #[arg(long)]
        json: bool,
    },

    /// Run a simulated controller until interrupted
    Simulate {
        /// Port to answer commands on
        #[arg(short, long, default_value_t = protocol::DEFAULT_REMOTE_PORT)]
        port: u16,

        /// Status report period for running motors in milliseconds (0 disables)
        #[arg(long, default_value_t = 100)]
        report_ms: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[derive(Subcommand)]
enum MotorAction {
    /// Start turning
    Start,
    /// Stop turning
    Stop,
    /// Set the direction
    Direction {
        /// Turn in reverse instead of forward
        #[arg(long)]
        reverse: bool,
    },
    /// Set the speed (0-1024)
    Speed { speed: u16 },
    /// Set the target angle
    Angle {
        #[arg(allow_hyphen_values = true)]
        angle: f32,
    },
    /// Set PID gains
    Pid { p: f32, i: f32, d: f32 },
    /// Switch control mode
    Mode {
        /// Closed loop instead of open loop
        #[arg(long)]
        closed_loop: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    if let Some(remote) = &cli.remote {
        config.link.remote_ip = remote.clone();
    }
    if let Some(port) = cli.remote_port {
        config.link.remote_port = port;
    }
    if let Some(port) = cli.local_port {
        config.link.local_port = port;
    }

    let simulator = if cli.simulate {
        let listening = matches!(cli.command, Commands::Listen { .. });
        Some(attach_simulator(&mut config, listening).await?)
    } else {
        None
    };

    match cli.command {
        Commands::Send { address, action } => {
            run_once(&config, |console| match action {
                MotorAction::Start => console.start_motor(address),
                MotorAction::Stop => console.stop_motor(address),
                MotorAction::Direction { reverse } => console.set_direction(address, !reverse),
                MotorAction::Speed { speed } => console.set_speed(address, speed),
                MotorAction::Angle { angle } => console.set_angle(address, angle),
                MotorAction::Pid { p, i, d } => console.set_pid(address, p, i, d),
                MotorAction::Mode { closed_loop } => console.set_control_mode(address, closed_loop),
            })
            .await?;
        }
        Commands::Sync {
            selection,
            direction,
            speed,
            reverse,
        } => {
            let selection: MotorMask = selection.parse()?;
            let mut direction: MotorMask = direction.parse()?;
            if reverse {
                direction = direction.flipped_within(selection);
            }
            run_once(&config, |console| console.sync_move(selection, direction, speed)).await?;
        }
        Commands::SyncStop => {
            run_once(&config, |console| console.sync_stop()).await?;
        }
        Commands::Preset { index, reverse } => {
            if config.preset(index).is_none() {
                anyhow::bail!(
                    "No preset at index {} ({} configured)",
                    index,
                    config.presets.len()
                );
            }
            run_once(&config, |console| console.trigger_preset(index, reverse)).await?;
        }
        Commands::Listen { json } => {
            run_listen(&config, json).await?;
        }
        Commands::Simulate { port, report_ms } => {
            run_simulator(port, report_ms).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    if let Some(simulator) = simulator {
        simulator.shutdown().await;
    }

    Ok(())
}

/// Start a simulated controller on loopback and point the link at it
async fn attach_simulator(config: &mut Config, listening: bool) -> anyhow::Result<Simulator> {
    let sim_config = if listening {
        SimulatorConfig {
            report_interval_ms: 100,
            report_to: Some(SocketAddr::from(([127, 0, 0, 1], config.link.local_port))),
            ..Default::default()
        }
    } else {
        SimulatorConfig::default()
    };

    let simulator = Simulator::spawn(SocketAddr::from(([127, 0, 0, 1], 0)), sim_config).await?;
    config.link.remote_ip = "127.0.0.1".to_string();
    config.link.remote_port = simulator.local_addr().port();
    Ok(simulator)
}

/// Answer commands until Ctrl+C
async fn run_simulator(port: u16, report_ms: u64) -> anyhow::Result<()> {
    let sim_config = SimulatorConfig {
        report_interval_ms: report_ms,
        ..Default::default()
    };
    let simulator = Simulator::spawn(SocketAddr::from(([0, 0, 0, 0], port)), sim_config).await?;

    println!("\n========================================");
    println!("  MotorLink Simulated Controller");
    println!("========================================");
    println!("  Listening: {}", simulator.local_addr());
    println!("  Motors: 1-{}", protocol::MOTOR_COUNT);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    simulator.shutdown().await;
    Ok(())
}

/// Link settings for one-shot commands. They never read telemetry, so they
/// bind an ephemeral local port.
fn one_shot_config(config: &Config) -> Config {
    let mut config = config.clone();
    config.link.local_port = 0;
    config
}

/// Connect, run one console action, print the log and disconnect
async fn run_once<F>(config: &Config, action: F) -> anyhow::Result<()>
where
    F: FnOnce(&MotorConsole) -> bool,
{
    let mut console = MotorConsole::new(&one_shot_config(config));
    let mut logs = console.take_log_receiver();

    if !console.connect_configured().await {
        drain_logs(logs.as_mut());
        anyhow::bail!(
            "Could not open link to {}:{}",
            config.link.remote_ip,
            config.link.remote_port
        );
    }

    let sent = action(&console);
    console.disconnect().await;
    drain_logs(logs.as_mut());

    if !sent {
        anyhow::bail!("Command was not sent");
    }
    Ok(())
}

fn drain_logs(logs: Option<&mut mpsc::Receiver<String>>) {
    if let Some(logs) = logs {
        while let Ok(line) = logs.try_recv() {
            println!("{}", line);
        }
    }
}

/// Print telemetry until Ctrl+C
async fn run_listen(config: &Config, json: bool) -> anyhow::Result<()> {
    let mut console = MotorConsole::new(config);
    let mut records = console
        .take_record_receiver()
        .ok_or_else(|| anyhow::anyhow!("Record receiver already taken"))?;
    let mut logs = console
        .take_log_receiver()
        .ok_or_else(|| anyhow::anyhow!("Log receiver already taken"))?;

    if !console.connect_configured().await {
        drain_logs(Some(&mut logs));
        anyhow::bail!("Could not open link on port {}", config.link.local_port);
    }

    println!("\n========================================");
    println!("  MotorLink Listening");
    println!("========================================");
    println!("  Controller: {}:{}", config.link.remote_ip, config.link.remote_port);
    if let Some(local) = console.local_addr() {
        println!("  Local: {}", local);
    }
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    let mut stats_timer = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            Some(record) = records.recv() => {
                if json {
                    println!("{}", serde_json::to_string(&record)?);
                } else {
                    println!("{}", describe_record(&record));
                }
            }
            Some(line) = logs.recv() => {
                println!("{}", line);
            }
            _ = stats_timer.tick() => {
                let stats = console.stats();
                tracing::debug!(
                    "Link stats: {} records, {} dropped, {} receive errors",
                    stats.records_received,
                    stats.datagrams_dropped,
                    stats.receive_errors
                );
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    console.disconnect().await;
    Ok(())
}

/// One-line human-readable rendering of a record
fn describe_record(record: &TelemetryRecord) -> String {
    let prefix = format!("[RX] ID:{} type {:#04x}", record.address, record.type_code);
    match &record.data {
        Telemetry::Pid { p, i, d, i_limit, out_limit, deadzone } => format!(
            "{} PID P={} I={} D={} i_limit={} out_limit={} deadzone={}",
            prefix, p, i, d, i_limit, out_limit, deadzone
        ),
        Telemetry::Status { position, velocity, current, voltage, error_code, state } => format!(
            "{} pos={:.2} vel={:.2} cur={:.2} volt={:.2} error={} state={}",
            prefix, position, velocity, current, voltage, error_code, state
        ),
        Telemetry::MultiMotorAck { current_speed, .. } => {
            let (selection, direction) = record.data.applied_masks().unwrap_or_default();
            format!(
                "{} sync ack selection={} direction={} speed={}",
                prefix, selection, direction, current_speed
            )
        }
        Telemetry::Raw { hex } => format!("{} raw {}", prefix, hex),
    }
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("MotorLink Protocol Information");
    println!("==============================\n");

    println!(
        "Frame: {} bytes (header {:02X} {:02X}, body {}, checksum 1)",
        protocol::FRAME_SIZE,
        protocol::HEADER[0],
        protocol::HEADER[1],
        protocol::BODY_SIZE
    );
    println!("Broadcast address: {:#04x}", protocol::BROADCAST_ADDRESS);
    println!("Motors per group: {}", protocol::MOTOR_COUNT);

    println!("\nLink:");
    println!("  Controller: {}:{}", config.link.remote_ip, config.link.remote_port);
    println!("  Local port: {}", config.link.local_port);

    println!("\nPresets:");
    if config.presets.is_empty() {
        println!("  (none)");
    }
    for (index, preset) in config.presets.iter().enumerate() {
        println!(
            "  [{}] selection={} direction={} speed={}",
            index, preset.selection, preset.direction, preset.speed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motorlink::protocol::payload;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["motorlink", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["motorlink", "send", "--address", "3", "speed", "512"]).unwrap();
        match cli.command {
            Commands::Send { address: 3, action: MotorAction::Speed { speed: 512 } } => {}
            _ => panic!("Wrong command"),
        }

        let cli = Cli::try_parse_from(["motorlink", "send", "-a", "1", "angle", "-45.5"]).unwrap();
        assert!(matches!(cli.command, Commands::Send { action: MotorAction::Angle { .. }, .. }));
    }

    #[test]
    fn test_cli_sync_parsing() {
        let cli = Cli::try_parse_from([
            "motorlink", "--remote", "10.0.0.2", "sync", "-s", "0100000", "--speed", "512", "--reverse",
        ])
        .unwrap();
        assert_eq!(cli.remote.as_deref(), Some("10.0.0.2"));
        match cli.command {
            Commands::Sync { selection, direction, speed, reverse } => {
                assert_eq!(selection, "0100000");
                assert_eq!(direction, "0000000");
                assert_eq!(speed, 512);
                assert!(reverse);
            }
            _ => panic!("Wrong command"),
        }
    }

    #[test]
    fn test_one_shot_config_uses_ephemeral_port() {
        let mut config = Config::default();
        config.link.local_port = 8081;
        config.link.remote_ip = "10.0.0.2".to_string();

        let one_shot = one_shot_config(&config);
        assert_eq!(one_shot.link.local_port, 0);
        assert_eq!(one_shot.link.remote_ip, "10.0.0.2");
        assert_eq!(config.link.local_port, 8081);
    }

    #[tokio::test]
    async fn test_one_shot_send_while_listen_holds_port() {
        let listen_port = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let mut config = Config::default();
        config.link.local_port = listen_port.local_addr().unwrap().port();

        let simulator = attach_simulator(&mut config, false).await.unwrap();
        assert_eq!(config.link.remote_ip, "127.0.0.1");

        run_once(&config, |console| console.start_motor(1)).await.unwrap();
        run_once(&config, |console| console.sync_stop()).await.unwrap();

        simulator.shutdown().await;
    }

    #[test]
    fn test_cli_simulate_parsing() {
        let cli = Cli::try_parse_from(["motorlink", "simulate", "--port", "9100"]).unwrap();
        assert!(matches!(cli.command, Commands::Simulate { port: 9100, report_ms: 100 }));

        let cli = Cli::try_parse_from(["motorlink", "--simulate", "send", "-a", "2", "start"]).unwrap();
        assert!(cli.simulate);
    }

    #[test]
    fn test_describe_record() {
        let body = payload::encode(4, false, 0x04, &[1.5, 2.0, 0.25, 12.0, 0.0, 1.0]);
        let record = protocol::response::process(&body).unwrap();
        assert_eq!(
            describe_record(&record),
            "[RX] ID:4 type 0x04 pos=1.50 vel=2.00 cur=0.25 volt=12.00 error=0 state=1"
        );
    }
}
