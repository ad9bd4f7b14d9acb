//! Connection lifecycle: sessions, instrument links, supervision

pub mod link;
pub mod session;
pub mod supervisor;

pub use link::{InstrumentLink, LinkState};
pub use session::{ConnectionSession, GuardVerdict};
pub use supervisor::LinkSupervisor;
