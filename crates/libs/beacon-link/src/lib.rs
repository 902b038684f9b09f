//! # beacon-link
//!
//! Wireless command channel for the Beacon handheld.
//!
//! A companion application talks to the device over a single BLE GATT
//! characteristic. Requests and responses are MessagePack maps that are too
//! large for one attribute value, so both directions are split into
//! fragments carrying a one-byte control header.
//!
//! ## Wire Format
//!
//! ```text
//! [control:1][payload:variable]
//!  bit 0 = more fragments follow
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! write -> Reassembler -> codec::decode_request -> Dispatcher -> codec::encode_reply -> Emitter -> read
//! ```
//!
//! The [`PairingGate`] sits in front of the dispatcher: nothing is routed
//! until the link reports a bonded pairing. Firmware images arrive through the
//! `ota_begin` / `ota_chunk` / `ota_end` functions which drive an
//! [`UpdateSession`] over a [`FlashStorage`] backend.
//!
//! ## Example
//!
//! ```rust
//! use beacon_link::{
//!     CommandChannel, Fragment, LinkConfig, LinkEvents, MemoryFlash, NullRadio,
//! };
//!
//! let channel = CommandChannel::new(LinkConfig::default(), MemoryFlash::new(2, 4096), NullRadio);
//! channel.on_connect(1);
//! let _passkey = channel.on_passkey_request();
//! channel.on_authentication_complete(1, true);
//!
//! let request = beacon_link::codec::request("get_settings", Vec::new()).unwrap();
//! channel.on_write(&Fragment::last(&request).to_wire());
//!
//! let reply = channel.on_read();
//! let fragment = Fragment::parse(&reply).unwrap();
//! assert!(!fragment.more_fragments);
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod display;
pub mod emitter;
pub mod error;
pub mod fragment;
pub mod ota;
pub mod pairing;
pub mod reassembly;
pub mod settings;
pub mod storage;

pub use channel::CommandChannel;
pub use codec::{Arguments, Reply, RpcRequest};
pub use config::LinkConfig;
pub use dispatch::{DeviceContext, Dispatcher, Invoke};
pub use display::{DisplaySource, Framebuffer};
pub use emitter::Emitter;
pub use error::{ConfigError, DecodeError, DispatchError, FragmentError, HandlerError};
pub use fragment::Fragment;
pub use ota::{SessionState, UpdateSession};
pub use pairing::{ConnectionState, LinkEvents, NullRadio, PairingGate, PairingStatus, RadioControl};
pub use reassembly::{Assembly, Reassembler};
pub use settings::DeviceSettings;
pub use storage::{DeadlineHandle, DeadlineStorage, FlashStorage, MemoryFlash, PartitionId, StorageError};

/// Request field naming the function to invoke.
pub const FUNCTION_NAME_FIELD: &str = "function_name";

/// Reply field present if and only if the call failed.
pub const ERROR_FIELD: &str = "error";

/// Numeric platform error code attached to storage faults.
pub const CODE_FIELD: &str = "code";
