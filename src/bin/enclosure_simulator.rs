use clap::{App, Arg};
use observatory::protocol::{EnclosureCommand, ShutterState, PROMPT, TERMINAL_PREAMBLE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const DEFAULT_PORT: &str = "22004";
const DEFAULT_MOTION_SECONDS: &str = "5";
const SW_VERSION: &str = "SIM-1.0";

#[derive(Debug, Clone, Copy)]
struct Shutter {
    state: ShutterState,
    motion: Option<(ShutterState, Instant)>,
}

impl Shutter {
    fn closed() -> Self {
        Self {
            state: ShutterState::Closed,
            motion: None,
        }
    }

    fn current(&mut self, now: Instant) -> ShutterState {
        if let Some((target, done)) = self.motion {
            if now >= done {
                self.state = target;
                self.motion = None;
            }
        }
        self.state
    }

    fn start(&mut self, target: ShutterState, after: Duration, now: Instant) {
        if self.current(now) == target {
            return;
        }
        self.state = match target {
            ShutterState::Open => ShutterState::Opening,
            _ => ShutterState::Closing,
        };
        self.motion = Some((target, now + after));
    }

    /// Halt mid-travel. A shutter stopped while moving reports open.
    fn stop(&mut self, now: Instant) {
        if self.motion.take().is_some() {
            self.state = ShutterState::Open;
        }
        self.current(now);
    }
}

/// Simulated enclosure controller.
struct Controller {
    shutters: [Shutter; 2],
    lights_on: bool,
    heartbeat: u32,
    manual: bool,
    motion: Duration,
    started: Instant,
}

impl Controller {
    fn new(manual: bool, motion: Duration) -> Self {
        Self {
            shutters: [Shutter::closed(); 2],
            lights_on: true,
            heartbeat: 0,
            manual,
            motion,
            started: Instant::now(),
        }
    }

    fn handle(&mut self, line: &str) -> String {
        let command = match line.parse::<EnclosureCommand>() {
            Ok(command) => command,
            Err(_) => {
                warn!("❓ Unknown command: {}", line);
                return "Success=FALSE, Error=Unknown command".into();
            }
        };
        info!("📨 {}", command);

        let now = Instant::now();
        let moves = matches!(
            command,
            EnclosureCommand::OpenShutters
                | EnclosureCommand::OpenShutter1
                | EnclosureCommand::OpenShutter2
                | EnclosureCommand::CloseShutters
                | EnclosureCommand::CloseSequential
                | EnclosureCommand::CloseShutter1
                | EnclosureCommand::CloseShutter2
        );
        if moves && self.manual {
            return "Success=FALSE, Error=Manual mode".into();
        }

        match command {
            EnclosureCommand::Status => return self.status(now),
            EnclosureCommand::Heartbeat => self.heartbeat = self.heartbeat.wrapping_add(1),
            EnclosureCommand::OpenShutter1 => self.shutters[0].start(ShutterState::Open, self.motion, now),
            EnclosureCommand::OpenShutter2 => self.shutters[1].start(ShutterState::Open, self.motion, now),
            EnclosureCommand::OpenShutters => {
                for shutter in &mut self.shutters {
                    shutter.start(ShutterState::Open, self.motion, now);
                }
            }
            EnclosureCommand::CloseShutter1 => self.shutters[0].start(ShutterState::Closed, self.motion, now),
            EnclosureCommand::CloseShutter2 => self.shutters[1].start(ShutterState::Closed, self.motion, now),
            EnclosureCommand::CloseShutters => {
                for shutter in &mut self.shutters {
                    shutter.start(ShutterState::Closed, self.motion, now);
                }
            }
            EnclosureCommand::CloseSequential => {
                self.shutters[1].start(ShutterState::Closed, self.motion, now);
                self.shutters[0].start(ShutterState::Closed, self.motion * 2, now);
            }
            EnclosureCommand::Stop => {
                for shutter in &mut self.shutters {
                    shutter.stop(now);
                }
            }
            EnclosureCommand::LightsOn => self.lights_on = true,
            EnclosureCommand::LightsOff => self.lights_on = false,
            _ => {}
        }
        "Success=TRUE".into()
    }

    fn status(&mut self, now: Instant) -> String {
        let shutter1 = self.shutters[0].current(now);
        let shutter2 = self.shutters[1].current(now);
        let mode = if self.manual { "MANUAL" } else { "AUTO" };
        format!(
            "Success=TRUE, Shutter1={shutter1}, Shutter2={shutter2}, SWVersion={SW_VERSION}, \
             EnclHumidity=20, EntryDoor1=CLOSED, EntryDoor2=CLOSED, PanelDoor=CLOSED, \
             Heartbeat={}, SystemUpTime={}, Fault=FALSE, Error=FALSE, PanelExhaustTemp=18.0, \
             EnclTemp=12.0, EnclExhaustTemp=12.0, EnclIntakeTemp=11.5, LightsOn={}, \
             EnclOpMode={mode}",
            self.heartbeat,
            self.started.elapsed().as_secs(),
            if self.lights_on { "TRUE" } else { "FALSE" },
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("enclosure-simulator")
        .version("0.1.0")
        .author("Observatory Operations Team")
        .about("🏠 Simulated enclosure controller speaking the line protocol over TCP")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Address to bind")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("motion")
                .long("motion-seconds")
                .value_name("SECONDS")
                .help("Time a shutter takes to open or close")
                .takes_value(true)
                .default_value(DEFAULT_MOTION_SECONDS),
        )
        .arg(
            Arg::with_name("manual")
                .long("manual")
                .help("Start in manual mode; motion commands are refused"),
        )
        .get_matches();

    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let bind = matches.value_of("bind").unwrap_or("127.0.0.1");
    let motion: f64 = matches.value_of("motion").unwrap_or(DEFAULT_MOTION_SECONDS).parse()?;
    let manual = matches.is_present("manual");

    println!("🏠 Enclosure Controller Simulator");
    println!("=================================");

    let controller = Arc::new(Mutex::new(Controller::new(
        manual,
        Duration::from_secs_f64(motion.max(0.0)),
    )));

    let listener = TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("🌐 Listening on {}:{} (manual mode: {})", bind, port, manual);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("🔗 Client connected: {}", addr);
                    let controller = Arc::clone(&controller);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, controller).await {
                            warn!("Client {} error: {}", addr, e);
                        }
                        info!("🔌 Client {} disconnected", addr);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("🏠 Enclosure simulator stopped");
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    controller: Arc<Mutex<Controller>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let preamble = TERMINAL_PREAMBLE.trim();

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed == preamble {
            continue;
        }

        let reply = controller.lock().await.handle(trimmed);
        writer.write_all(format!("{reply}\r\n{PROMPT}").as_bytes()).await?;
    }
    Ok(())
}
