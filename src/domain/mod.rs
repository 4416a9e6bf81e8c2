//! Core domain types for the guestlist admission system.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Users (external collaborator, referenced only)
//! - Events and their status state machine
//! - Participation request typestate machine

pub mod event;
pub mod request;
pub mod user;
