use chrono::Utc;
use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use observatory::calibration::CalibrationSequencer;
use observatory::clock::{Clock, Observing, SystemClock};
use observatory::config::ObservatoryConfig;
use observatory::enclosure::Enclosure;
use observatory::ephemeris::{next_crossing, night_name, night_start, sun_position, Crossing, NightTimes, Site};
use observatory::instruments::{Imager, SimulatedCamera, SimulatedTelescope};
use observatory::notify::{Notifier, SpoolNotifier};
use observatory::overrides::FileOverrideStore;
use observatory::protocol::{succeeded, TcpTransport};
use observatory::safety::SafetyEngine;
use observatory::scheduler::NightScheduler;
use observatory::target::load_targets;
use observatory::weather::HttpWeatherSource;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

const LOG_FILE_NAME: &str = "observatory.log";
/// Sky level per second of exposure the stand-in camera reports.
const SIMULATED_SKY_RATE: f64 = 400.0;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = App::new("observatory")
        .version("0.1.0")
        .author("Observatory Operations Team")
        .about("🔭 Robotic observatory night controller")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Observatory configuration (JSON)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Enclosure controller host (overrides the config)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Enclosure controller port (overrides the config)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run the observing night until the enclosure is closed after dawn")
                .arg(
                    Arg::with_name("targets")
                        .short("t")
                        .long("targets")
                        .value_name("FILE")
                        .help("Target list (default: <night>.txt)")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("enclosure")
                .about("Send one raw command to the enclosure controller")
                .arg(
                    Arg::with_name("command")
                        .help("Controller command, e.g. STATUS or LIGHTS_ON")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(SubCommand::with_name("status").about("Show enclosure controller status"))
        .subcommand(
            SubCommand::with_name("open")
                .about("Open both shutters")
                .arg(
                    Arg::with_name("force")
                        .long("force")
                        .help("Open even if the weather is not safe"),
                ),
        )
        .subcommand(SubCommand::with_name("close").about("Close both shutters, retrying until closed"))
        .subcommand(SubCommand::with_name("crack").about("Open shutter 1 briefly for ventilation"))
        .subcommand(
            SubCommand::with_name("weather")
                .about("Fetch current weather and evaluate the safety limits")
                .arg(
                    Arg::with_name("open")
                        .long("open")
                        .help("Evaluate against the close limits, as if the enclosure were open"),
                ),
        )
        .subcommand(SubCommand::with_name("sun").about("Show sun position and tonight's twilight times"))
        .get_matches();

    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");
    let config = load_config(&matches)?;

    match matches.subcommand() {
        ("run", Some(sub_matches)) => handle_run(sub_matches, config, verbose).await,
        ("enclosure", Some(sub_matches)) => {
            init_tracing(verbose, None)?;
            handle_enclosure_command(sub_matches, &config, format).await
        }
        ("status", Some(_)) => {
            init_tracing(verbose, None)?;
            handle_status(&config, format).await
        }
        ("open", Some(sub_matches)) => {
            init_tracing(verbose, None)?;
            handle_open(sub_matches, &config).await
        }
        ("close", Some(_)) => {
            init_tracing(verbose, None)?;
            handle_close(&config).await
        }
        ("crack", Some(_)) => {
            init_tracing(verbose, None)?;
            handle_crack(&config).await
        }
        ("weather", Some(sub_matches)) => {
            init_tracing(verbose, None)?;
            handle_weather(sub_matches, &config, format).await
        }
        ("sun", Some(_)) => handle_sun(&config, format),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Check the weather verdict", "observatory weather".bright_cyan());
            println!("  {} Show enclosure status", "observatory status".bright_cyan());
            println!("  {} Run tonight", "observatory run".bright_cyan());
            Ok(())
        }
    }
}

fn load_config(matches: &ArgMatches<'_>) -> Result<ObservatoryConfig, Box<dyn Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => ObservatoryConfig::load(Path::new(path))?,
        None => ObservatoryConfig::default(),
    };
    if let Some(host) = matches.value_of("host") {
        config.enclosure.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.enclosure.port = port.parse()?;
    }
    Ok(config)
}

/// Console logging, plus a plain-text copy in `log_file` when given.
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let console = tracing_subscriber::fmt::layer().with_filter(level);

    let file = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry().with(console).with(file).try_init()?;
    Ok(())
}

fn notifier(config: &ObservatoryConfig) -> Arc<dyn Notifier> {
    Arc::new(SpoolNotifier::new(config.site.log_dir.join("outbox")))
}

fn enclosure(config: &ObservatoryConfig, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Arc<Enclosure> {
    Arc::new(Enclosure::new(
        config.enclosure.clone(),
        Box::new(TcpTransport::from_config(&config.enclosure)),
        notifier,
        clock,
    ))
}

fn safety_engine(
    config: &ObservatoryConfig,
    clock: Arc<dyn Clock>,
    observing: Observing,
    notifier: Arc<dyn Notifier>,
) -> Result<Arc<SafetyEngine>, Box<dyn Error>> {
    let source = HttpWeatherSource::new(config.weather.clone(), Site::from(&config.site), Arc::clone(&clock))?;
    Ok(Arc::new(
        SafetyEngine::new(
            Arc::new(source),
            Arc::new(FileOverrideStore::new(&config.overrides)),
            notifier,
            clock,
            observing,
            config.limits.clone(),
            config.weather.clone(),
        )
        .with_site_name(config.site.name.clone()),
    ))
}

async fn handle_run(
    matches: &ArgMatches<'_>,
    config: ObservatoryConfig,
    verbose: bool,
) -> Result<(), Box<dyn Error>> {
    let site = Site::from(&config.site);
    let night = night_name(&site, Utc::now());
    let log_file = config.site.log_dir.join(&night).join(LOG_FILE_NAME);
    init_tracing(verbose, Some(&log_file))?;

    println!("{}", "🔭 Robotic Observatory".bright_blue().bold());
    println!("{} {} ({})", "Night".dimmed(), night.bright_white(), config.site.name);

    let targets_path = matches
        .value_of("targets")
        .map_or_else(|| PathBuf::from(format!("{night}.txt")), PathBuf::from);
    let targets = match load_targets(&targets_path) {
        Ok(targets) => targets,
        Err(e) => {
            warn!("{}; observing calibrations only", e);
            Vec::new()
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let observing = Observing::new();
    let notifier = notifier(&config);

    let stop = observing.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; closing up");
            stop.stop();
        }
    });

    warn!("No camera or telescope driver is linked; using simulated instruments");
    let imager = Imager::new(
        Arc::new(SimulatedCamera::new(config.calibration.bias_level, SIMULATED_SKY_RATE)),
        Arc::clone(&clock),
        config.imager.clone(),
        &config.site.data_dir,
        &night,
    )?;
    let calibration = CalibrationSequencer::new(
        Arc::new(imager),
        Arc::new(SimulatedTelescope::default()),
        Arc::clone(&clock),
        observing.clone(),
        site,
        config.calibration.clone(),
    );

    let safety = safety_engine(&config, Arc::clone(&clock), observing.clone(), Arc::clone(&notifier))?;
    let enclosure = enclosure(&config, Arc::clone(&clock), notifier);

    let mut scheduler = NightScheduler::new(
        safety,
        enclosure,
        calibration,
        clock,
        observing,
        site,
        config.scheduler.clone(),
    );

    match scheduler.run_night(targets).await {
        Ok(summary) => {
            info!("Night summary: {:?}", summary);
            println!("{} {}", "✅".green(), "Night complete".bright_green());
            println!("{} {}", "Exposures:".bright_white(), summary.exposures);
            println!("{} {}", "Calibration frames:".bright_white(), summary.calibration_frames);
            println!(
                "{} {} evening, {} morning",
                "Flats:".bright_white(),
                summary.evening_flats,
                summary.morning_flats
            );
            println!(
                "{} {} completed, {} skipped, {} aborted",
                "Targets:".bright_white(),
                summary.completed.len(),
                summary.skipped.len(),
                summary.aborted.len()
            );
            Ok(())
        }
        Err(e) => {
            error!("Night failed: {}", e);
            println!("{} {}", "❌".red(), format!("Night failed: {e}").bright_red());
            Err(e.into())
        }
    }
}

async fn handle_enclosure_command(
    matches: &ArgMatches<'_>,
    config: &ObservatoryConfig,
    format: &str,
) -> Result<(), Box<dyn Error>> {
    let text = matches.value_of("command").unwrap_or_default();
    let enclosure = enclosure(config, Arc::new(SystemClock), notifier(config));
    let reply = enclosure.send_text(text).await?;

    match format {
        "json" => println!(
            "{}",
            serde_json::json!({ "command": text, "success": succeeded(&reply), "reply": reply })
        ),
        _ => {
            if succeeded(&reply) {
                println!("{} {}", "✅".green(), text.bright_white());
            } else {
                println!("{} {}", "❌".red(), text.bright_white());
            }
            println!("{}", reply);
        }
    }
    Ok(())
}

async fn handle_status(config: &ObservatoryConfig, format: &str) -> Result<(), Box<dyn Error>> {
    let enclosure = enclosure(config, Arc::new(SystemClock), notifier(config));
    let status = enclosure.status().await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&status)?),
        _ => {
            println!("{} {}", "🏠".bright_blue(), format!("Enclosure {}", enclosure.id()).bright_blue().bold());
            println!("{}", "═══════════════════════════".bright_blue());
            for shutter in [1, 2] {
                let state = status.shutter(shutter).to_string();
                println!("{} {}", format!("Shutter {shutter}:").bright_white(), state.bright_cyan());
            }
            if status.manual_mode() {
                println!("{} {}", "⚠️".yellow(), "Manual mode: software control disabled".yellow());
            }
            for (key, value) in status.fields() {
                if key != "Shutter1" && key != "Shutter2" {
                    println!("  {:<18} {}", key.dimmed(), value);
                }
            }
        }
    }
    Ok(())
}

async fn handle_open(matches: &ArgMatches<'_>, config: &ObservatoryConfig) -> Result<(), Box<dyn Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let observing = Observing::new();
    let notifier = notifier(config);

    if matches.is_present("force") {
        println!("{} {}", "⚠️".yellow(), "Skipping the weather check".yellow());
    } else {
        let safety = safety_engine(config, Arc::clone(&clock), observing.clone(), Arc::clone(&notifier))?;
        let verdict = safety.evaluate(false).await;
        if !verdict.safe {
            println!("{} {}", "❌".red(), "Not safe to open".bright_red());
            for reason in &verdict.reasons {
                println!("  • {}", reason);
            }
            println!("{} Use {} to open anyway", "💡".yellow(), "--force".bright_cyan());
            return Ok(());
        }
    }

    let enclosure = enclosure(config, clock, notifier);
    enclosure.open_both(&observing).await?;
    println!("{} {}", "✅".green(), "Both shutters open".bright_green());
    Ok(())
}

async fn handle_close(config: &ObservatoryConfig) -> Result<(), Box<dyn Error>> {
    let enclosure = enclosure(config, Arc::new(SystemClock), notifier(config));
    enclosure.close_both().await?;
    println!("{} {}", "✅".green(), "Both shutters closed".bright_green());
    Ok(())
}

async fn handle_crack(config: &ObservatoryConfig) -> Result<(), Box<dyn Error>> {
    let enclosure = enclosure(config, Arc::new(SystemClock), notifier(config));
    enclosure.crack().await?;
    println!("{} {}", "✅".green(), "Shutter 1 cracked".bright_green());
    Ok(())
}

async fn handle_weather(
    matches: &ArgMatches<'_>,
    config: &ObservatoryConfig,
    format: &str,
) -> Result<(), Box<dyn Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let safety = safety_engine(config, clock, Observing::new(), notifier(config))?;
    let verdict = safety.evaluate(matches.is_present("open")).await;
    let snapshot = safety.state().await.last_snapshot;

    match format {
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "verdict": verdict, "weather": snapshot }))?
        ),
        _ => {
            if let Some(weather) = &snapshot {
                println!("{} {}", "🌤️".bright_blue(), "Current Conditions".bright_blue().bold());
                println!("  {:<16} {}", "Station time".dimmed(), weather.date);
                println!("  {:<16} {:.1} C", "Temperature".dimmed(), weather.temperature);
                println!("  {:<16} {:.1} %", "Humidity".dimmed(), weather.humidity);
                println!("  {:<16} {:.1} C", "Dew point".dimmed(), weather.dew_point);
                println!("  {:<16} {:.1} / {:.1}", "Wind / gust".dimmed(), weather.wind_speed, weather.wind_gust);
                println!("  {:<16} {:.2}", "Total rain".dimmed(), weather.total_rain);
                println!("  {:<16} {:.2}", "Sun altitude".dimmed(), weather.sun_altitude);
                for reading in &weather.clouds {
                    println!("  {:<16} {:.1}", reading.sensor.dimmed(), reading.value);
                }
            }
            if verdict.safe {
                println!("{} {}", "✅".green(), "OK to open".bright_green());
            } else {
                println!("{} {}", "❌".red(), "Not OK to open".bright_red());
                for reason in &verdict.reasons {
                    println!("  • {}", reason);
                }
            }
        }
    }
    Ok(())
}

fn handle_sun(config: &ObservatoryConfig, format: &str) -> Result<(), Box<dyn Error>> {
    let site = Site::from(&config.site);
    let now = Utc::now();
    let position = sun_position(&site, now);
    let times = NightTimes::compute(&site, now);
    let start = night_start(&site, now);
    let calibration = &config.calibration;
    let evening_flats = next_crossing(&site, start, calibration.flat_max_sun_alt, Crossing::Setting);
    let morning_flats = next_crossing(&site, start, calibration.flat_min_sun_alt, Crossing::Rising);

    match format {
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "night": night_name(&site, now),
                "altitude": position.altitude,
                "azimuth": position.azimuth,
                "sunset": times.map(|t| t.sunset),
                "sunrise": times.map(|t| t.sunrise),
                "eveningFlats": evening_flats,
                "morningFlats": morning_flats,
            }))?
        ),
        _ => {
            println!("{} {}", "☀️".yellow(), format!("Sun at {}", config.site.name).bright_blue().bold());
            println!("  {:<16} {}", "Night".dimmed(), night_name(&site, now));
            println!("  {:<16} {:.2}", "Altitude".dimmed(), position.altitude);
            println!("  {:<16} {:.2}", "Azimuth".dimmed(), position.azimuth);
            match times {
                Some(times) => {
                    println!("  {:<16} {}", "Sunset".dimmed(), times.sunset);
                    println!("  {:<16} {}", "Sunrise".dimmed(), times.sunrise);
                }
                None => println!("  {}", "No sunset/sunrise in the next day".yellow()),
            }
            if let Some(time) = evening_flats {
                println!("  {:<16} {}", "Evening flats".dimmed(), time);
            }
            if let Some(time) = morning_flats {
                println!("  {:<16} {}", "Morning flats".dimmed(), time);
            }
        }
    }
    Ok(())
}
