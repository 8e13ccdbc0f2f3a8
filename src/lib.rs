//! PatentTrack - USPTO patent application status tracker
//!
//! Tracks patent applications by polling the USPTO Open Data Portal,
//! reconciling responses against a local SQLite store and surfacing only
//! genuinely new prosecution events.

pub mod columns;
pub mod credentials;
pub mod db;
pub mod poller;
pub mod prefs;
pub mod sync;
pub mod uspto;
