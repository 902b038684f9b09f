//! The command characteristic as seen from the wireless stack.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::LinkConfig;
use crate::dispatch::{Dispatcher, UNAUTHENTICATED};
use crate::emitter::Emitter;
use crate::fragment::Fragment;
use crate::ota::SessionState;
use crate::pairing::{ConnectionState, LinkEvents, PairingGate, PairingStatus, RadioControl};
use crate::reassembly::{Assembly, Reassembler};
use crate::storage::{DeadlineStorage, FlashStorage};

struct Link<S: FlashStorage, R> {
    gate: PairingGate<R>,
    reassembler: Reassembler,
    emitter: Emitter,
    dispatcher: Dispatcher<S>,
}

impl<S: FlashStorage, R: RadioControl> Link<S, R> {
    fn reset_buffers(&mut self) {
        self.reassembler.reset();
        self.emitter.clear();
    }

    fn abort_update(&mut self) {
        if self.dispatcher.abort_update() {
            log::warn!("ble: update aborted by connection change");
        }
    }

    fn complete(&mut self, request: Vec<u8>) {
        let response = if self.gate.is_authorized() {
            let response = self.dispatcher.handle(&request);
            let device_name = self.dispatcher.settings().device_name.clone();
            self.gate.set_device_name(&device_name);
            response
        } else {
            log::warn!("ble: rejecting {} byte request on unbonded link", request.len());
            self.dispatcher.error_response(UNAUTHENTICATED)
        };
        self.emitter.stage(response);
    }
}

/// Reassembler, dispatcher, emitter and pairing state for one link.
///
/// Every callback takes the same lock, so a request is fully dispatched and
/// its response staged before the next fragment or read is processed.
pub struct CommandChannel<S: FlashStorage, R> {
    link: Mutex<Link<S, R>>,
}

impl<S, R> CommandChannel<DeadlineStorage<S>, R>
where
    S: FlashStorage + Send + 'static,
    S::Handle: Send + 'static,
    R: RadioControl,
{
    /// Channel whose storage calls are bounded by `config.storage_timeout_ms`.
    pub fn new(config: LinkConfig, storage: S, radio: R) -> Self {
        let storage = DeadlineStorage::new(storage, config.storage_timeout());
        let gate = PairingGate::new(radio, &config.device_name());
        Self::from_parts(&config, gate, Dispatcher::new(storage, &config))
    }
}

impl<S: FlashStorage, R: RadioControl> CommandChannel<S, R> {
    pub fn from_parts(config: &LinkConfig, gate: PairingGate<R>, dispatcher: Dispatcher<S>) -> Self {
        Self {
            link: Mutex::new(Link {
                gate,
                reassembler: Reassembler::new(config.max_request_bytes),
                emitter: Emitter::new(config.max_fragment_payload),
                dispatcher,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Link<S, R>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start advertising the command service.
    pub fn advertise(&self) {
        self.lock().gate.advertise();
    }

    /// Characteristic write from the peer.
    pub fn on_write(&self, raw: &[u8]) {
        let fragment = match Fragment::parse(raw) {
            Ok(fragment) => fragment,
            Err(err) => {
                log::warn!("ble: discarding write: {}", err);
                return;
            }
        };
        let mut link = self.lock();
        match link.reassembler.push(fragment.more_fragments, fragment.payload) {
            Assembly::Pending | Assembly::Overflow { .. } => {}
            Assembly::Complete(request) => link.complete(request),
        }
    }

    /// Characteristic read from the peer: the next response fragment.
    pub fn on_read(&self) -> Vec<u8> {
        self.lock().emitter.poll_wire()
    }

    pub fn pairing_status(&self) -> PairingStatus {
        self.lock().gate.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().gate.state().clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.lock().dispatcher.session().state()
    }

    /// Run `f` against the dispatcher under the channel lock.
    pub fn with_dispatcher<T>(&self, f: impl FnOnce(&mut Dispatcher<S>) -> T) -> T {
        f(&mut self.lock().dispatcher)
    }

    /// Run `f` against the radio under the channel lock.
    pub fn with_radio<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(self.lock().gate.radio_mut())
    }
}

impl<S: FlashStorage, R: RadioControl> LinkEvents for CommandChannel<S, R> {
    fn on_connect(&self, conn_handle: u16) {
        let mut link = self.lock();
        link.gate.connect(conn_handle);
        link.abort_update();
        link.reset_buffers();
    }

    fn on_disconnect(&self, conn_handle: u16, reason: i32) {
        let mut link = self.lock();
        if link.gate.disconnect(conn_handle, reason) {
            link.abort_update();
            link.reset_buffers();
        }
    }

    fn on_authentication_complete(&self, conn_handle: u16, bonded: bool) {
        self.lock().gate.authentication_complete(conn_handle, bonded);
    }

    fn on_passkey_request(&self) -> u32 {
        self.lock().gate.passkey()
    }
}
