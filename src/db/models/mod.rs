#![allow(unused_imports)]

//! Database models for the calendar sync engine.
//! Each table lives in its own file; everything is re-exported here so callers can
//! use `crate::db::models::*`.

pub mod appointment;
pub mod connection;
pub mod pending_mapping;
pub mod sync_log;

pub use self::appointment::*;
pub use self::connection::*;
pub use self::pending_mapping::*;
pub use self::sync_log::*;
