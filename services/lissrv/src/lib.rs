//! Laboratory Instrument Communication Service (`lissrv`)
//!
//! Maintains TCP links to clinical analyzers, speaks the ASTM E1381
//! low-level protocol and HL7 v2 over MLLP, reassembles result messages
//! exactly, and hands them to external collaborators together with link
//! status events.
//!
//! The engine is structured as:
//! - [`core`]: connection lifecycle, with per-connection sessions,
//!   instrument links (client or server role), and the link supervisor
//! - [`protocols`]: the two wire protocol handlers and auto-detection
//! - [`utils`]: pure checksum and text-decoding helpers
//! - [`config`], [`events`], [`error`]: configuration surface, output
//!   event seam, and the service error type

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod protocols;
pub mod utils;

pub use crate::config::{AppConfig, InstrumentConfig};
pub use crate::core::supervisor::LinkSupervisor;
pub use crate::error::{LisSrvError, Result};
pub use crate::events::{ChannelSink, EngineEvent, EventSink, ReassembledMessage};
