//! Simulated motor controller
//!
//! Listens for command frames on a UDP port and answers them the way the
//! controller firmware does: a PID echo for gain changes, a status frame for
//! single-motor commands and a sync ack for group moves. Used to run the
//! console and the CLI without hardware.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{
    frame, payload, Body, Command, ControlMode, Direction, MessageType, MotorMask,
    BROADCAST_ADDRESS, MOTOR_COUNT,
};

/// Reported supply voltage
const SUPPLY_VOLTAGE: f32 = 12.0;

/// Degrees travelled per second per unit of speed
const DEGREES_PER_SPEED_UNIT: f32 = 0.35;

/// Simulator errors
#[derive(Error, Debug)]
pub enum SimulatorError {
    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type SimulatorResult<T> = Result<T, SimulatorError>;

/// Simulator settings
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Period of unsolicited status reports for running motors, 0 disables them
    pub report_interval_ms: u64,
    /// Where reports go before the first command arrives
    pub report_to: Option<SocketAddr>,
    pub i_limit: f32,
    pub out_limit: f32,
    pub deadzone: f32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 0,
            report_to: None,
            i_limit: 500.0,
            out_limit: 1024.0,
            deadzone: 0.5,
        }
    }
}

impl SimulatorConfig {
    fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_ms > 0).then(|| Duration::from_millis(self.report_interval_ms))
    }
}

/// State of one simulated motor
#[derive(Debug, Clone, Copy)]
struct MotorModel {
    running: bool,
    direction: Direction,
    speed: f32,
    position: f32,
    mode: ControlMode,
    pid: [f32; 3],
}

impl Default for MotorModel {
    fn default() -> Self {
        Self {
            running: false,
            direction: Direction::Forward,
            speed: 0.0,
            position: 0.0,
            mode: ControlMode::OpenLoop,
            pid: [0.0; 3],
        }
    }
}

impl MotorModel {
    fn velocity(&self) -> f32 {
        match (self.running, self.direction) {
            (false, _) => 0.0,
            (true, Direction::Forward) => self.speed,
            (true, Direction::Reverse) => -self.speed,
        }
    }

    fn advance(&mut self, elapsed: f32) {
        self.position += self.velocity() * DEGREES_PER_SPEED_UNIT * elapsed;
    }

    /// position, velocity, current, voltage, error_code, state
    fn status_fields(&self) -> [f32; 6] {
        let current = 0.05 + self.velocity().abs() * 0.001;
        let state = if self.running { 1.0 } else { 0.0 };
        [self.position, self.velocity(), current, SUPPLY_VOLTAGE, 0.0, state]
    }
}

/// Seven motors behind one controller
#[derive(Debug)]
struct Device {
    config: SimulatorConfig,
    motors: [MotorModel; MOTOR_COUNT as usize],
    group: MotorMask,
    group_direction: MotorMask,
    last_update: Instant,
}

impl Device {
    fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            motors: [MotorModel::default(); MOTOR_COUNT as usize],
            group: MotorMask::NONE,
            group_direction: MotorMask::NONE,
            last_update: Instant::now(),
        }
    }

    fn motor_mut(&mut self, address: u8) -> Option<&mut MotorModel> {
        let index = address.checked_sub(1)?;
        self.motors.get_mut(index as usize)
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f32();
        self.last_update = now;
        for motor in self.motors.iter_mut() {
            motor.advance(elapsed);
        }
    }

    fn status(&self, address: u8, message_type: MessageType) -> Option<Body> {
        let motor = self.motors.get(address.checked_sub(1)? as usize)?;
        Some(payload::encode(address, false, message_type.code(), &motor.status_fields()))
    }

    fn group_ack(&self, speed: f32) -> Body {
        payload::encode(
            BROADCAST_ADDRESS,
            false,
            MessageType::MultiMotorAck.code(),
            &[self.group.as_f32(), self.group_direction.as_f32(), speed],
        )
    }

    /// Apply a command and build the reply, if any
    fn handle(&mut self, address: u8, command: Command) -> Option<Body> {
        self.tick();

        match command {
            Command::SyncMove {
                selection,
                direction,
                speed,
            } => {
                for motor in selection.motors() {
                    if let Some(model) = self.motor_mut(motor) {
                        model.running = true;
                        model.speed = speed;
                        model.direction = Direction::from_forward(direction.contains(motor));
                    }
                }
                self.group = selection;
                self.group_direction = direction;
                Some(self.group_ack(speed))
            }
            Command::SyncStop => {
                for motor in self.group.motors() {
                    if let Some(model) = self.motor_mut(motor) {
                        model.running = false;
                    }
                }
                Some(self.group_ack(0.0))
            }
            Command::SetPid { p, i, d } => {
                let model = self.motor_mut(address)?;
                model.pid = [p, i, d];
                let [p, i, d] = model.pid;
                Some(payload::encode(
                    address,
                    false,
                    MessageType::PidEcho.code(),
                    &[p, i, d, self.config.i_limit, self.config.out_limit, self.config.deadzone],
                ))
            }
            Command::SetControlMode(mode) => {
                self.motor_mut(address)?.mode = mode;
                self.status(address, MessageType::ModeStatus)
            }
            single => {
                let model = self.motor_mut(address)?;
                match single {
                    Command::MotorStart => model.running = true,
                    Command::MotorStop => model.running = false,
                    Command::SetDirection(direction) => model.direction = direction,
                    Command::SetSpeed(speed) => model.speed = speed,
                    Command::SetTargetAngle(angle) => {
                        if model.mode == ControlMode::ClosedLoop {
                            model.position = angle;
                        }
                    }
                    _ => {}
                }
                self.status(address, MessageType::Status)
            }
        }
    }

    /// Status bodies for every running motor
    fn reports(&mut self) -> Vec<Body> {
        self.tick();
        (1..=MOTOR_COUNT)
            .filter(|address| self.motors[(*address - 1) as usize].running)
            .filter_map(|address| self.status(address, MessageType::Status))
            .collect()
    }
}

/// A running simulated controller
pub struct Simulator {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Simulator {
    /// Bind `bind_addr` and start answering commands
    pub async fn spawn(bind_addr: SocketAddr, config: SimulatorConfig) -> SimulatorResult<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SimulatorError::BindFailed(format!("{}: {}", bind_addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SimulatorError::BindFailed(e.to_string()))?;

        tracing::info!("Simulated controller on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(run(socket, shutdown_rx, Device::new(config)));

        Ok(Self {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the simulator and wait for its task
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.try_send(());
        if let Err(e) = self.task.await {
            tracing::warn!("Simulator task ended abnormally: {}", e);
        }
    }
}

async fn run(socket: UdpSocket, mut shutdown_rx: mpsc::Receiver<()>, mut device: Device) {
    let report_interval = device.config.report_interval();
    let mut peer = device.config.report_to;
    let mut ticker = tokio::time::interval(report_interval.unwrap_or(Duration::from_secs(1)));
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                tracing::debug!("Simulator shutting down");
                break;
            }

            result = socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!("Simulator receive error: {}", e);
                        continue;
                    }
                };
                peer = Some(from);

                let Some((address, command)) = frame::unwrap(&buf[..len])
                    .and_then(|body| Command::decode(&body))
                else {
                    tracing::debug!("Simulator ignoring {} byte datagram from {}", len, from);
                    continue;
                };

                tracing::debug!("Simulator <- ID:{} {}", address, command);
                match device.handle(address, command) {
                    Some(reply) => reply_to(&socket, &reply, from).await,
                    None => tracing::debug!("No motor at address {}", address),
                }
            }

            _ = ticker.tick(), if report_interval.is_some() => {
                if let Some(peer) = peer {
                    for body in device.reports() {
                        reply_to(&socket, &body, peer).await;
                    }
                }
            }
        }
    }
}

async fn reply_to(socket: &UdpSocket, body: &Body, to: SocketAddr) {
    let frame = match frame::wrap(body) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!("Simulator cannot frame reply: {}", e);
            return;
        }
    };
    if let Err(e) = socket.send_to(&frame, to).await {
        tracing::warn!("Simulator reply to {} failed: {}", to, e);
    }
}
