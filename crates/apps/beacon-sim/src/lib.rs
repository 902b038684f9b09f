//! Host-side simulator for the Beacon command channel.
//!
//! The device half is the real [`beacon_link::CommandChannel`], backed by
//! [`flash::FileFlash`] so images land on disk. A tokio task stands in for the
//! radio and the [`companion::Companion`] plays the phone app.

pub mod companion;
pub mod config;
pub mod error;
pub mod flash;
pub mod radio;

use std::sync::Arc;

use beacon_link::{CommandChannel, DeadlineStorage, FlashStorage, Framebuffer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use companion::{max_chunk_size, render_screen, Companion, FlashReport};
pub use config::{FlashLayout, SimConfig};
pub use error::SimError;
pub use flash::{FileFlash, FlashStatus, PartitionStatus};
pub use radio::{spawn_radio, GattOp, LogRadio};

pub const DISPLAY_WIDTH: usize = 128;
pub const DISPLAY_HEIGHT: usize = 64;

pub type SimChannel<S> = CommandChannel<DeadlineStorage<S>, LogRadio>;

/// Boot screen: a one pixel frame around the panel.
pub fn splash(width: usize, height: usize) -> Framebuffer {
    let mut screen = Framebuffer::new(width, height);
    for x in 0..width {
        screen.set_pixel(x, 0, true);
        screen.set_pixel(x, height.saturating_sub(1), true);
    }
    for y in 0..height {
        screen.set_pixel(0, y, true);
        screen.set_pixel(width.saturating_sub(1), y, true);
    }
    screen
}

/// A running device plus its simulated radio.
pub struct Simulator<S>
where
    S: FlashStorage + Send + 'static,
    S::Handle: Send + 'static,
{
    config: SimConfig,
    channel: Arc<SimChannel<S>>,
    ops: mpsc::Sender<GattOp>,
    radio_task: JoinHandle<usize>,
}

impl<S> Simulator<S>
where
    S: FlashStorage + Send + 'static,
    S::Handle: Send + 'static,
{
    /// Boot the device on `storage` and start advertising. Must be called
    /// from within a tokio runtime.
    pub fn start(config: SimConfig, storage: S) -> Self {
        let channel = Arc::new(CommandChannel::new(config.link.clone(), storage, LogRadio));
        channel.with_dispatcher(|dispatcher| {
            dispatcher.attach_display(splash(DISPLAY_WIDTH, DISPLAY_HEIGHT))
        });
        channel.advertise();
        let (ops, radio_task) = spawn_radio(Arc::clone(&channel));
        Self { config, channel, ops, radio_task }
    }

    /// A companion bound to this device's radio.
    pub fn companion(&self) -> Companion {
        Companion::new(self.ops.clone(), self.config.conn_handle, &self.config.link)
    }

    pub fn channel(&self) -> &SimChannel<S> {
        &self.channel
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Run `f` against the device's storage once its queued calls have run.
    pub fn with_storage<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut S) -> T + Send + 'static,
    ) -> Result<T, SimError> {
        let result =
            self.channel.with_dispatcher(|dispatcher| dispatcher.session().storage().with_inner(f))?;
        Ok(result)
    }

    /// Stop the radio task once every companion has been dropped, returning
    /// the number of operations it delivered.
    pub async fn shutdown(self) -> Result<usize, SimError> {
        let Self { ops, radio_task, .. } = self;
        drop(ops);
        radio_task.await.map_err(|err| {
            log::error!("sim: radio task failed: {}", err);
            SimError::RadioClosed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splash_draws_a_frame() {
        let screen = splash(16, 8);
        assert!(screen.pixel(0, 0));
        assert!(screen.pixel(15, 7));
        assert!(screen.pixel(7, 0));
        assert!(!screen.pixel(7, 4));
    }
}
