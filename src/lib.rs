//! Care Booking: patient-facing appointment booking wizard.

pub mod booking;
pub mod config;
pub mod directory;
pub mod error;
