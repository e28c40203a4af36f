#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pacebms_lib
//!
//! This crate implements the ASCII-framed RS485 protocol spoken by
//! PACE-dialect BMS (Battery Management System) devices and provides both
//! synchronous and asynchronous clients on top of it.
//!
//! The protocol core is pure and transport-free: frame construction and
//! verification ([`protocol`]), reassembly of frames out of an arbitrarily
//! chunked byte stream ([`reassembler`]) and per-address request correlation
//! ([`context`]). Responses on this bus carry a status code where the
//! service id would be, so the last request sent to each address has to be
//! remembered to interpret what comes back.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//! You need to enable the client you want to use.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling
//!   the `pacebms` command-line tool.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** client using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` support for the decoded records.
//! - `bin-dependencies`: Enables all features required by the `pacebms`
//!   binary executable.

/// Contains error types for the library.
mod error;
/// Per-address request/response correlation state.
pub mod context;
/// Frame codec and per-service payload decoding/encoding.
pub mod protocol;
/// Chunked-stream to frame reassembly.
pub mod reassembler;

pub use error::Error;

/// Synchronous client for PACE-dialect BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous client for PACE-dialect BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
