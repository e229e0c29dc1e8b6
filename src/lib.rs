//! Bitácora visitor registration core.

pub mod config;
pub mod destinations;
pub mod document;
pub mod error;
pub mod logging;
pub mod phone;
pub mod session;
pub mod wizard;
