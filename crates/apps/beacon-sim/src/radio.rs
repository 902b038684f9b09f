//! Simulated wireless stack.
//!
//! On the device, GATT callbacks arrive from the radio's own task. Here a
//! tokio task plays that role: the companion posts [`GattOp`]s to it and the
//! task delivers each one to the [`CommandChannel`], in order.

use std::sync::Arc;

use beacon_link::pairing::AdvertisingProfile;
use beacon_link::{CommandChannel, FlashStorage, LinkEvents, RadioControl};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const OP_QUEUE_DEPTH: usize = 32;

#[derive(Debug)]
pub enum GattOp {
    Connect { conn_handle: u16 },
    Disconnect { conn_handle: u16, reason: i32 },
    PasskeyRequest { reply: oneshot::Sender<u32> },
    AuthenticationComplete { conn_handle: u16, bonded: bool },
    Write { value: Vec<u8> },
    Read { reply: oneshot::Sender<Vec<u8>> },
}

/// Radio commands are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRadio;

impl RadioControl for LogRadio {
    fn start_security(&mut self, conn_handle: u16) {
        log::info!("sim: security requested conn={}", conn_handle);
    }

    fn start_advertising(&mut self, profile: &AdvertisingProfile) {
        log::info!(
            "sim: advertising {:?} service={} appearance={}",
            profile.local_name,
            profile.service_uuid,
            profile.appearance
        );
    }
}

fn deliver<S, R>(channel: &CommandChannel<S, R>, op: GattOp)
where
    S: FlashStorage,
    R: RadioControl,
{
    match op {
        GattOp::Connect { conn_handle } => channel.on_connect(conn_handle),
        GattOp::Disconnect { conn_handle, reason } => channel.on_disconnect(conn_handle, reason),
        GattOp::PasskeyRequest { reply } => {
            let passkey = channel.on_passkey_request();
            log::info!("sim: display shows passkey {:06}", passkey);
            let _ = reply.send(passkey);
        }
        GattOp::AuthenticationComplete { conn_handle, bonded } => {
            channel.on_authentication_complete(conn_handle, bonded)
        }
        GattOp::Write { value } => channel.on_write(&value),
        GattOp::Read { reply } => {
            let _ = reply.send(channel.on_read());
        }
    }
}

/// Spawn the radio task. It runs until every sender is dropped and returns
/// the number of operations it delivered.
pub fn spawn_radio<S, R>(
    channel: Arc<CommandChannel<S, R>>,
) -> (mpsc::Sender<GattOp>, JoinHandle<usize>)
where
    S: FlashStorage + Send + 'static,
    S::Handle: Send,
    R: RadioControl + Send + 'static,
{
    let (ops, mut inbox) = mpsc::channel(OP_QUEUE_DEPTH);
    let task = tokio::spawn(async move {
        let mut delivered = 0usize;
        while let Some(op) = inbox.recv().await {
            deliver(channel.as_ref(), op);
            delivered += 1;
        }
        log::debug!("sim: radio task stopped after {} ops", delivered);
        delivered
    });
    (ops, task)
}
