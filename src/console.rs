//! Operator console
//!
//! The surface the UI layer talks to: connect/disconnect, one method per
//! command, preset group moves, a telemetry subscription and a log of
//! human-readable status lines. Records produced on the receive task are
//! handed over through a channel, never through shared state.

use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{Config, LinkConfig, PresetConfig};
use crate::network::{resolve_host, LinkStats, Transceiver, TransceiverConfig};
use crate::protocol::{
    Command, ControlMode, Direction, MotorMask, TelemetryRecord, BROADCAST_ADDRESS, MOTOR_COUNT,
};

/// Highest speed the controller accepts
pub const MAX_SPEED: u16 = 1024;

/// Input validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Invalid motor address: {0} (expected 1-{})", MOTOR_COUNT)]
    InvalidAddress(u8),

    #[error("Speed out of range: {0} (max: {})", MAX_SPEED)]
    SpeedOutOfRange(u16),

    #[error("No preset at index {0}")]
    UnknownPreset(usize),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;

/// Single-motor commands address motors 1 through 7
pub fn validate_address(address: u8) -> ConsoleResult<u8> {
    if !(1..=MOTOR_COUNT).contains(&address) {
        return Err(ConsoleError::InvalidAddress(address));
    }
    Ok(address)
}

pub fn validate_speed(speed: u16) -> ConsoleResult<u16> {
    if speed > MAX_SPEED {
        return Err(ConsoleError::SpeedOutOfRange(speed));
    }
    Ok(speed)
}

/// Operator console over one transceiver
pub struct MotorConsole {
    link: LinkConfig,
    presets: Vec<PresetConfig>,
    transceiver: Transceiver,
    /// Record receiver (for consumers)
    record_rx: Option<mpsc::Receiver<TelemetryRecord>>,
    log_tx: mpsc::Sender<String>,
    /// Log receiver (for consumers)
    log_rx: Option<mpsc::Receiver<String>>,
}

impl MotorConsole {
    /// Create a console from the application config
    pub fn new(config: &Config) -> Self {
        Self::with_parts(
            config.link.clone(),
            config.presets.clone(),
            config.link.transceiver_config(),
        )
    }

    pub fn with_parts(
        link: LinkConfig,
        presets: Vec<PresetConfig>,
        transceiver_config: TransceiverConfig,
    ) -> Self {
        let capacity = transceiver_config.channel_capacity;
        let (record_tx, record_rx) = mpsc::channel(capacity);
        let (log_tx, log_rx) = mpsc::channel(capacity);

        let transceiver = Transceiver::with_callback(transceiver_config, move |record| {
            if let Err(e) = record_tx.try_send(record) {
                tracing::warn!("Dropping telemetry record: {}", e);
            }
        });

        Self {
            link,
            presets,
            transceiver,
            record_rx: Some(record_rx),
            log_tx,
            log_rx: Some(log_rx),
        }
    }

    /// Take the record receiver (can only be called once)
    pub fn take_record_receiver(&mut self) -> Option<mpsc::Receiver<TelemetryRecord>> {
        self.record_rx.take()
    }

    /// Take the log receiver (can only be called once)
    pub fn take_log_receiver(&mut self) -> Option<mpsc::Receiver<String>> {
        self.log_rx.take()
    }

    fn log(&self, line: String) {
        tracing::info!("{}", line);
        let _ = self.log_tx.try_send(line);
    }

    /// Connect to the controller at `ip:port` and start listening on the
    /// configured local port. An existing connection is closed first.
    pub async fn connect(&mut self, ip: &str, port: u16) -> bool {
        if self.transceiver.is_listening() {
            self.transceiver.stop().await;
        }

        let remote = match resolve_host(ip, port).await {
            Ok(addr) => addr,
            Err(e) => {
                self.log(format!("[ERR] Cannot resolve {}: {}", ip, e));
                return false;
            }
        };

        match self.transceiver.start(remote, self.link.local_port).await {
            Ok(()) => {
                self.log(format!("[SYS] Console started, target: {}", remote));
                true
            }
            Err(e) => {
                self.log(format!("[ERR] Failed to start link: {}", e));
                false
            }
        }
    }

    /// Connect using the configured remote address
    pub async fn connect_configured(&mut self) -> bool {
        let ip = self.link.remote_ip.clone();
        let port = self.link.remote_port;
        self.connect(&ip, port).await
    }

    pub async fn disconnect(&mut self) {
        self.transceiver.stop().await;
        self.log("[SYS] Link closed".to_string());
    }

    pub fn is_connected(&self) -> bool {
        self.transceiver.is_listening()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transceiver.local_addr()
    }

    pub fn stats(&self) -> LinkStats {
        self.transceiver.stats()
    }

    /// Encode, frame and send a command
    pub fn execute(&self, address: u8, command: Command) -> bool {
        if !command.is_group() {
            if let Err(e) = validate_address(address) {
                self.log(format!("[ERR] {}", e));
                return false;
            }
        }

        let body = command.encode(address);
        if !self.transceiver.send_body(&body) {
            self.log(format!("[ERR] Failed to send {}", command));
            return false;
        }

        if command.is_group() {
            self.log(format!("[TX] Group {}", command));
        } else {
            self.log(format!("[TX] ID:{} {}", address, command));
        }
        true
    }

    /// 0x11
    pub fn start_motor(&self, address: u8) -> bool {
        self.execute(address, Command::MotorStart)
    }

    /// 0x12
    pub fn stop_motor(&self, address: u8) -> bool {
        self.execute(address, Command::MotorStop)
    }

    /// 0x13
    pub fn set_direction(&self, address: u8, is_forward: bool) -> bool {
        self.execute(address, Command::SetDirection(Direction::from_forward(is_forward)))
    }

    /// 0x14
    pub fn set_speed(&self, address: u8, speed: u16) -> bool {
        match validate_speed(speed) {
            Ok(speed) => self.execute(address, Command::SetSpeed(speed as f32)),
            Err(e) => {
                self.log(format!("[ERR] Motor {}: {}", address, e));
                false
            }
        }
    }

    /// 0x21
    pub fn set_angle(&self, address: u8, angle: f32) -> bool {
        self.execute(address, Command::SetTargetAngle(angle))
    }

    /// 0x22
    pub fn set_pid(&self, address: u8, p: f32, i: f32, d: f32) -> bool {
        self.execute(address, Command::SetPid { p, i, d })
    }

    /// 0x31
    pub fn set_control_mode(&self, address: u8, is_closed_loop: bool) -> bool {
        self.execute(
            address,
            Command::SetControlMode(ControlMode::from_closed_loop(is_closed_loop)),
        )
    }

    /// 0x41
    pub fn sync_move(&self, selection: MotorMask, direction: MotorMask, speed: u16) -> bool {
        match validate_speed(speed) {
            Ok(speed) => self.execute(
                BROADCAST_ADDRESS,
                Command::SyncMove {
                    selection,
                    direction,
                    speed: speed as f32,
                },
            ),
            Err(e) => {
                self.log(format!("[ERR] Sync move: {}", e));
                false
            }
        }
    }

    /// 0x42
    pub fn sync_stop(&self) -> bool {
        self.execute(BROADCAST_ADDRESS, Command::SyncStop)
    }

    /// Jog button pressed: set the direction, then start
    pub fn press(&self, address: u8, is_forward: bool) -> bool {
        self.set_direction(address, is_forward) && self.start_motor(address)
    }

    /// Jog button released
    pub fn release(&self, address: u8) -> bool {
        self.stop_motor(address)
    }

    /// Preset rows, in group order
    pub fn presets(&self) -> &[PresetConfig] {
        &self.presets
    }

    /// Run the preset at `index` as a sync move.
    ///
    /// With `reverse`, the selected motors run against their preset
    /// direction: `direction XOR selection`.
    pub fn trigger_preset(&self, index: usize, reverse: bool) -> bool {
        let Some(preset) = self.presets.get(index).copied() else {
            self.log(format!("[ERR] {}", ConsoleError::UnknownPreset(index)));
            return false;
        };

        let direction = if reverse {
            preset.direction.flipped_within(preset.selection)
        } else {
            preset.direction
        };

        self.sync_move(preset.selection, direction, preset.speed)
    }
}
