use arrayvec::ArrayString;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

pub const MAX_COMMAND_SIZE: usize = 32;
pub const MAX_RESPONSE_SIZE: usize = 4096;

/// Terminal preamble the controller expects before the first command.
pub const TERMINAL_PREAMBLE: &str = "vt100\r\n";
/// Prompt the controller prints once a reply is complete.
pub const PROMPT: &str = "#>";

pub type CommandFrame = ArrayString<MAX_COMMAND_SIZE>;

/// Keys every `STATUS` reply must carry.
pub const REQUIRED_STATUS_KEYS: [&str; 16] = [
    "Shutter1",
    "Shutter2",
    "SWVersion",
    "EnclHumidity",
    "EntryDoor1",
    "EntryDoor2",
    "PanelDoor",
    "Heartbeat",
    "SystemUpTime",
    "Fault",
    "Error",
    "PanelExhaustTemp",
    "EnclTemp",
    "EnclExhaustTemp",
    "EnclIntakeTemp",
    "LightsOn",
];

macro_rules! enclosure_commands {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        /// The complete set of commands the enclosure controller accepts.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EnclosureCommand {
            $(
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl EnclosureCommand {
            pub const ALL: &'static [EnclosureCommand] = &[$(EnclosureCommand::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(EnclosureCommand::$variant => $wire,)+
                }
            }
        }

        impl FromStr for EnclosureCommand {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($wire => Ok(EnclosureCommand::$variant),)+
                    other => Err(ProtocolError::UnknownCommand(other.to_string())),
                }
            }
        }
    };
}

enclosure_commands! {
    Heartbeat => "HEARTBEAT",
    Stop => "STOP",
    OpenShutters => "OPEN_SHUTTERS",
    CloseShutters => "CLOSE_SHUTTERS",
    CloseSequential => "CLOSE_SEQUENTIAL",
    OpenShutter1 => "OPEN_SHUTTER_1",
    CloseShutter1 => "CLOSE_SHUTTER_1",
    OpenShutter2 => "OPEN_SHUTTER_2",
    CloseShutter2 => "CLOSE_SHUTTER_2",
    LightsOn => "LIGHTS_ON",
    LightsOff => "LIGHTS_OFF",
    EncFansHi => "ENC_FANS_HI",
    EncFansMed => "ENC_FANS_MED",
    EncFansLow => "ENC_FANS_LOW",
    EncFansOff => "ENC_FANS_OFF",
    PanelLedGreen => "PANEL_LED_GREEN",
    PanelLedYellow => "PANEL_LED_YELLOW",
    PanelLedRed => "PANEL_LED_RED",
    PanelLedOff => "PANEL_LED_OFF",
    DoorLedGreen => "DOOR_LED_GREEN",
    DoorLedYellow => "DOOR_LED_YELLOW",
    DoorLedRed => "DOOR_LED_RED",
    DoorLedOff => "DOOR_LED_OFF",
    SonAlertOn => "SON_ALERT_ON",
    SonAlertOff => "SON_ALERT_OFF",
    LedSteady => "LED_STEADY",
    LedBlink => "LED_BLINK",
    McbResetPoleFans => "MCB_RESET_POLE_FANS",
    McbResetTailFans => "MCB_RESET_TAIL_FANS",
    McbResetOtaBlower => "MCB_RESET_OTA_BLOWER",
    McbResetPanelFans => "MCB_RESET_PANEL_FANS",
    McbTripPoleFans => "MCB_TRIP_POLE_FANS",
    McbTripTailFans => "MCB_TRIP_TAIL_FANS",
    McbTripPanelFans => "MCB_TRIP_PANEL_FANS",
    Status => "STATUS",
    GetErrors => "GET_ERRORS",
    GetFaults => "GET_FAULTS",
    ClearErrors => "CLEAR_ERRORS",
    ClearFaults => "CLEAR_FAULTS",
    ResetPac => "RESET_PAC",
}

impl EnclosureCommand {
    pub fn open_shutter(shutter: u8) -> Result<Self, ProtocolError> {
        match shutter {
            1 => Ok(EnclosureCommand::OpenShutter1),
            2 => Ok(EnclosureCommand::OpenShutter2),
            other => Err(ProtocolError::InvalidShutter(other)),
        }
    }

    /// Wire frame: the command followed by CRLF.
    pub fn frame(self) -> CommandFrame {
        let mut frame = CommandFrame::new();
        // Longest command plus CRLF fits MAX_COMMAND_SIZE.
        let _ = frame.try_push_str(self.as_str());
        let _ = frame.try_push_str("\r\n");
        frame
    }
}

impl fmt::Display for EnclosureCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("command not recognized: {0}")]
    UnknownCommand(String),

    #[error("invalid shutter {0}; expected 1 or 2")]
    InvalidShutter(u8),

    #[error("timed out connecting to {addr}")]
    ConnectTimeout { addr: String },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no reply to {command} after {attempts} attempts")]
    EmptyResponse {
        command: EnclosureCommand,
        attempts: u32,
    },

    #[error("status reply is missing required key {0}")]
    MissingStatusKey(String),
}

impl ProtocolError {
    /// Errors that a fresh connection may clear.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProtocolError::UnknownCommand(_) | ProtocolError::InvalidShutter(_)
        )
    }
}

/// Whether a reply reports `Success=TRUE`.
pub fn succeeded(response: &str) -> bool {
    response.contains("Success=TRUE")
}

/// Split a comma separated `Key=Value` reply into a map. Entries without `=`
/// are ignored.
pub fn parse_fields(response: &str) -> BTreeMap<String, String> {
    response
        .split(',')
        .filter_map(|entry| entry.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    Closed,
    Opening,
    Open,
    Closing,
    Fault,
}

impl ShutterState {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "CLOSED" => ShutterState::Closed,
            "OPENING" => ShutterState::Opening,
            "OPEN" => ShutterState::Open,
            "CLOSING" => ShutterState::Closing,
            other => {
                if other != "FAULT" {
                    warn!("Unrecognized shutter state {:?}; treating as fault", text);
                }
                ShutterState::Fault
            }
        }
    }
}

impl fmt::Display for ShutterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutterState::Closed => "CLOSED",
            ShutterState::Opening => "OPENING",
            ShutterState::Open => "OPEN",
            ShutterState::Closing => "CLOSING",
            ShutterState::Fault => "FAULT",
        })
    }
}

/// A validated `STATUS` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnclosureStatus {
    fields: BTreeMap<String, String>,
}

impl EnclosureStatus {
    pub fn parse(response: &str) -> Result<Self, ProtocolError> {
        let fields = parse_fields(response);
        if let Some(missing) = REQUIRED_STATUS_KEYS
            .iter()
            .find(|key| !fields.contains_key(**key))
        {
            return Err(ProtocolError::MissingStatusKey((*missing).to_string()));
        }
        Ok(Self { fields })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn shutter(&self, shutter: u8) -> ShutterState {
        let key = match shutter {
            1 => "Shutter1",
            2 => "Shutter2",
            _ => return ShutterState::Fault,
        };
        self.get(key).map_or(ShutterState::Fault, ShutterState::parse)
    }

    pub fn both_closed(&self) -> bool {
        self.shutter(1) == ShutterState::Closed && self.shutter(2) == ShutterState::Closed
    }

    pub fn both_open(&self) -> bool {
        self.shutter(1) == ShutterState::Open && self.shutter(2) == ShutterState::Open
    }

    /// The controller has been switched to local control and ignores
    /// software commands.
    pub fn manual_mode(&self) -> bool {
        self.get("EnclOpMode")
            .is_some_and(|mode| mode.eq_ignore_ascii_case("MANUAL"))
    }
}

/// One request/response exchange with the enclosure controller.
#[async_trait]
pub trait EnclosureTransport: Send + Sync {
    async fn exchange(&self, command: EnclosureCommand) -> Result<String, ProtocolError>;
}

/// Connect, send, read until the prompt or timeout, disconnect.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    empty_retries: u32,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_millis(500),
            empty_retries: 5,
        }
    }

    pub fn from_config(config: &crate::config::EnclosureConfig) -> Self {
        Self::new(&config.host, config.port)
            .with_timeouts(config.connect_timeout(), config.read_timeout())
            .with_empty_retries(config.empty_response_retries)
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn with_empty_retries(mut self, retries: u32) -> Self {
        self.empty_retries = retries.max(1);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream, ProtocolError> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProtocolError::Connect {
                addr: self.addr.clone(),
                source,
            }),
            Err(_) => Err(ProtocolError::ConnectTimeout {
                addr: self.addr.clone(),
            }),
        }
    }

    /// Read until the prompt appears, the peer hangs up or the read timeout
    /// elapses, whichever comes first.
    async fn read_reply(&self, stream: &mut TcpStream) -> Result<String, ProtocolError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut reply: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 512];

        while reply.len() < MAX_RESPONSE_SIZE {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => {
                    reply.extend_from_slice(&chunk[..n]);
                    if reply.windows(PROMPT.len()).any(|w| w == PROMPT.as_bytes()) {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(ProtocolError::Io(e)),
            }
        }

        let text = String::from_utf8_lossy(&reply);
        Ok(text.replace(PROMPT, "").trim().to_string())
    }
}

#[async_trait]
impl EnclosureTransport for TcpTransport {
    async fn exchange(&self, command: EnclosureCommand) -> Result<String, ProtocolError> {
        let mut stream = self.connect().await?;
        stream.write_all(TERMINAL_PREAMBLE.as_bytes()).await?;

        let frame = command.frame();
        for attempt in 1..=self.empty_retries {
            stream.write_all(frame.as_bytes()).await?;
            let reply = self.read_reply(&mut stream).await?;
            if !reply.is_empty() {
                debug!("{} -> {}", command, reply);
                let _ = stream.shutdown().await;
                return Ok(reply);
            }
            debug!("Empty reply to {} (attempt {})", command, attempt);
        }

        let _ = stream.shutdown().await;
        Err(ProtocolError::EmptyResponse {
            command,
            attempts: self.empty_retries,
        })
    }
}
