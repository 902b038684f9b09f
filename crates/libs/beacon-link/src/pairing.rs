//! Connection lifecycle and the bonding gate in front of the dispatcher.
//!
//! The wireless stack reports connection events through [`LinkEvents`] and is
//! driven back through [`RadioControl`]. Pairing uses passkey entry: the
//! device shows a six digit code and the companion types it in. Only a
//! bonded link may reach the dispatcher.

use rand_core::{OsRng, RngCore};

pub const ADVERTISED_NAME_PREFIX: &str = "DegenBeacon ";
pub const SERVICE_UUID: &str = "033c3d34-8405-46db-8326-07169d5353a9";
pub const RPC_CHARACTERISTIC_UUID: &str = "033c3d37-8405-46db-8326-07169d5353a9";
/// GAP appearance "Generic Watch".
pub const APPEARANCE_GENERIC_WATCH: u16 = 192;

pub const PASSKEY_MIN: u32 = 100_000;
pub const PASSKEY_MAX: u32 = 999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    DisplayOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityRequirements {
    pub bonding: bool,
    pub mitm_protection: bool,
    pub secure_connections: bool,
    pub io_capability: IoCapability,
}

impl Default for SecurityRequirements {
    fn default() -> Self {
        Self {
            bonding: true,
            mitm_protection: true,
            secure_connections: true,
            io_capability: IoCapability::DisplayOnly,
        }
    }
}

/// What the radio should advertise and how it should secure connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingProfile {
    pub local_name: String,
    pub service_uuid: &'static str,
    pub characteristic_uuid: &'static str,
    pub appearance: u16,
    pub security: SecurityRequirements,
}

impl AdvertisingProfile {
    pub fn for_device(device_name: &str) -> Self {
        Self {
            local_name: format!("{ADVERTISED_NAME_PREFIX}{device_name}"),
            service_uuid: SERVICE_UUID,
            characteristic_uuid: RPC_CHARACTERISTIC_UUID,
            appearance: APPEARANCE_GENERIC_WATCH,
            security: SecurityRequirements::default(),
        }
    }
}

/// Commands issued to the wireless stack.
pub trait RadioControl {
    /// Ask the stack to run pairing/encryption on `conn_handle`.
    fn start_security(&mut self, conn_handle: u16);

    fn start_advertising(&mut self, profile: &AdvertisingProfile);
}

/// Radio that ignores every command.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRadio;

impl RadioControl for NullRadio {
    fn start_security(&mut self, _conn_handle: u16) {}

    fn start_advertising(&mut self, _profile: &AdvertisingProfile) {}
}

/// Callbacks delivered by the wireless stack.
///
/// Methods take `&self`: implementors synchronise internally because the
/// stack calls in from its own context.
pub trait LinkEvents {
    fn on_connect(&self, conn_handle: u16);

    fn on_disconnect(&self, conn_handle: u16, reason: i32);

    fn on_authentication_complete(&self, conn_handle: u16, bonded: bool);

    /// Returns the passkey the user must enter on the companion.
    fn on_passkey_request(&self) -> u32;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub bonded: bool,
    pub pairing_code: Option<u32>,
    pub conn_handle: Option<u16>,
}

/// What the pairing screen should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    AwaitingConnection,
    DisplayingPasskey(u32),
    Connected { bonded: bool },
}

pub struct PairingGate<R> {
    radio: R,
    state: ConnectionState,
    profile: AdvertisingProfile,
    rng: Box<dyn RngCore + Send>,
}

impl<R: RadioControl> PairingGate<R> {
    pub fn new(radio: R, device_name: &str) -> Self {
        Self::with_rng(radio, device_name, OsRng)
    }

    pub fn with_rng(radio: R, device_name: &str, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            radio,
            state: ConnectionState::default(),
            profile: AdvertisingProfile::for_device(device_name),
            rng: Box::new(rng),
        }
    }

    pub fn advertise(&mut self) {
        log::info!("ble: advertising as {:?}", self.profile.local_name);
        self.radio.start_advertising(&self.profile);
    }

    /// Takes effect the next time advertising starts.
    pub fn set_device_name(&mut self, device_name: &str) {
        self.profile.local_name = format!("{ADVERTISED_NAME_PREFIX}{device_name}");
    }

    /// Record a new connection and request link security.
    ///
    /// Returns the handle of the connection it replaced, if any.
    pub fn connect(&mut self, conn_handle: u16) -> Option<u16> {
        let replaced = self.state.conn_handle.filter(|previous| *previous != conn_handle);
        if let Some(previous) = replaced {
            log::warn!("ble: connection {} replaces {}", conn_handle, previous);
        }
        self.state = ConnectionState {
            connected: true,
            bonded: false,
            pairing_code: None,
            conn_handle: Some(conn_handle),
        };
        log::info!("ble: connected conn={}", conn_handle);
        self.radio.start_security(conn_handle);
        replaced
    }

    /// Returns `false` for a stale handle, which leaves state untouched.
    pub fn disconnect(&mut self, conn_handle: u16, reason: i32) -> bool {
        if self.state.conn_handle != Some(conn_handle) {
            log::debug!("ble: ignoring disconnect of stale conn={}", conn_handle);
            return false;
        }
        log::info!("ble: disconnected conn={} reason={}", conn_handle, reason);
        self.state = ConnectionState::default();
        self.advertise();
        true
    }

    pub fn passkey(&mut self) -> u32 {
        let passkey = PASSKEY_MIN + self.rng.next_u32() % (PASSKEY_MAX - PASSKEY_MIN + 1);
        if !self.state.connected {
            log::warn!("ble: passkey requested with no connection, not displaying it");
            return passkey;
        }
        self.state.pairing_code = Some(passkey);
        log::info!("ble: passkey requested");
        passkey
    }

    pub fn authentication_complete(&mut self, conn_handle: u16, bonded: bool) -> bool {
        if self.state.conn_handle != Some(conn_handle) {
            log::warn!("ble: authentication result for stale conn={}", conn_handle);
            return false;
        }
        self.state.bonded = bonded;
        self.state.pairing_code = None;
        if bonded {
            log::info!("ble: conn={} bonded", conn_handle);
        } else {
            log::warn!("ble: conn={} failed to bond", conn_handle);
        }
        true
    }

    pub fn is_authorized(&self) -> bool {
        self.state.connected && self.state.bonded
    }

    pub fn status(&self) -> PairingStatus {
        match (&self.state.pairing_code, self.state.connected) {
            (_, false) => PairingStatus::AwaitingConnection,
            (Some(code), true) => PairingStatus::DisplayingPasskey(*code),
            (None, true) => PairingStatus::Connected { bonded: self.state.bonded },
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn profile(&self) -> &AdvertisingProfile {
        &self.profile
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }
}

impl<R: std::fmt::Debug> std::fmt::Debug for PairingGate<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingGate")
            .field("radio", &self.radio)
            .field("state", &self.state)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}
