//! # Robotic Observatory
//!
//! Unattended control of a robotic telescope through one observing night:
//! weather safety decisions, the enclosure controller protocol, calibration
//! and twilight flats, and science target scheduling.
//!
//! ## Features
//!
//! - **Safety engine**: hysteretic open/close limits, rain and snow lockouts,
//!   cloud-sensor fallback and operator overrides
//! - **Enclosure link**: whitelisted line protocol over TCP with a shared
//!   command lock, heartbeat task and close-until-closed retries
//! - **Calibration**: bias/dark batches and closed-loop twilight flats
//! - **Night scheduler**: stage machine from calibration to close, with
//!   time-windowed targets and enclosure gating
//! - **Virtual time**: every wait goes through a [`clock::Clock`], so a whole
//!   night can be replayed in tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use observatory::config::ObservatoryConfig;
//! use observatory::ephemeris::{NightTimes, Site};
//!
//! let config = ObservatoryConfig::default();
//! let site = Site::from(&config.site);
//! if let Some(times) = NightTimes::compute(&site, chrono::Utc::now()) {
//!     println!("sunset {} sunrise {}", times.sunset, times.sunrise);
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`weather`] - station and cloud feeds into a [`weather::WeatherSnapshot`]
//! - [`safety`] - limit tables and the [`safety::SafetyEngine`]
//! - [`protocol`] - enclosure commands, status parsing and TCP transport
//! - [`enclosure`] - stateful [`enclosure::Enclosure`] client
//! - [`calibration`] - bias, dark and flat sequences
//! - [`scheduler`] - the [`scheduler::NightScheduler`]

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]

pub mod calibration;
pub mod clock;
pub mod config;
pub mod enclosure;
pub mod ephemeris;
pub mod instruments;
pub mod notify;
pub mod overrides;
pub mod protocol;
pub mod safety;
pub mod scheduler;
pub mod target;
pub mod weather;

pub use config::ObservatoryConfig;
pub use enclosure::Enclosure;
pub use safety::{SafetyEngine, SafetyLimits};
pub use scheduler::{NightScheduler, NightSummary};
