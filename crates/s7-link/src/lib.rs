//! PLC link layer for Siemens S7 controllers.
//!
//! This crate provides:
//! - [`ConnectionManager`], one actor task per PLC that connects lazily,
//!   reconnects after failures and polls cyclically
//! - [`scheduler`] with single-flight read and write lanes and the I/O watchdog
//! - [`address`] codec between tag descriptors and transport addresses
//! - [`validate`] write value coercion and [`decode`] poll buffer decoding
//! - [`ReadEndpoint`] and [`WriteEndpoint`] handles delivering [`TagResult`]s
//! - [`Transport`] trait, with an in-memory [`simulated`] implementation
//!
//! ```ignore
//! let manager = ConnectionManager::spawn(&config.connection, transport);
//! let mut level = manager.register_read(tag, ReadOptions {
//!     topic: "plant/level".into(),
//!     period: Some(Duration::from_secs(2)),
//!     trigger_once: false,
//! });
//! while let Some(result) = level.recv().await {
//!     println!("{}", serde_json::to_string(&result)?);
//! }
//! ```

pub mod address;
pub mod decode;
pub mod endpoint;
pub mod manager;
pub mod scheduler;
#[cfg(feature = "simulated")]
pub mod simulated;
pub mod transport;
pub mod validate;

pub use address::{encode, parse_address, AddressForm, TagAddresses, WireAddress};
pub use decode::{decode, Quality, ReadOutcome, ReadResultBuffer};
pub use endpoint::{EndpointId, ReadEndpoint, ReadOptions, ResultPayload, TagResult, WriteEndpoint};
pub use manager::{ConnectionManager, LinkEvent, LinkStats};
#[cfg(feature = "simulated")]
pub use simulated::{SimBehavior, SimulatedTransport, TransportCall};
pub use transport::{PollResult, PolledValue, Transport, TransportState, WriteValue};
pub use validate::{validate, ValidatedWrite};
