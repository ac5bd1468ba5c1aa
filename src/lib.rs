//! Reliable relay of logged contacts from a local UDP broadcast to a remote logbook.
//!
//! Records decoded from the logging software's datagrams are written to a durable
//! backlog before any upload is attempted, and are purged only once the logbook
//! confirms them (or reports it already has them).
//!
//! # Examples
//!
//! Decoding a frame:
//! ```
//! use qsorelay::decode::{decode_frame, encode_logged_adif};
//!
//! let frame = encode_logged_adif(2, "WSJT-X", "<adif_ver:5>3.1.0<EOH><call:5>K1ABC<eor>");
//! let record = decode_frame(&frame).expect("logged contact");
//! assert!(record.payload().starts_with("<adif_ver"));
//! ```
//!
//! Running the relay over a SQLite backlog:
//! ```no_run
//! use qsorelay::{
//!     backlog::sqlite::SqliteBacklog,
//!     config::ApiKey,
//!     delivery::qrz::{QrzClient, QrzClientConfig},
//!     record::LogRecord,
//!     runtime::handle::{spawn_relay, RuntimeConfig},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let backlog = SqliteBacklog::open("backlog.sqlite3").expect("open sqlite");
//! let client = QrzClient::new(QrzClientConfig {
//!     url: "https://logbook.qrz.com/api".to_string(),
//!     api_key: ApiKey::new("XXXX-XXXX-XXXX-XXXX"),
//!     timeout: std::time::Duration::from_secs(30),
//! }).expect("client");
//! let handle = spawn_relay(Box::new(backlog), client, RuntimeConfig::default())
//!     .await
//!     .expect("spawn");
//! handle.submit(LogRecord::new("<adif_ver:5>3.1.0<EOH><call:5>K1ABC<eor>")).await.expect("submit");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Durable backlog trait and its file and SQLite implementations.
pub mod backlog;
/// Configuration read from the environment.
pub mod config;
/// Broadcast frame decoder.
pub mod decode;
/// Logbook upload and reply classification.
pub mod delivery;
/// Contact record value type.
pub mod record;
/// Listener, persist stage, and delivery worker.
pub mod runtime;
/// Protocol constants and shared aliases.
pub mod types;
