//! Library crate for mfp-scan-rs: discovery and fingerprinting of network scanners and
//! multifunction printers.
pub mod command;
pub mod config;
pub mod error;
pub mod fastpath;
pub mod fingerprint;
pub mod ipp;
pub mod matcher;
pub mod netdetect;
pub mod orchestrator;
pub mod ports;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;
