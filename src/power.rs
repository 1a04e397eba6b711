/*
 * Suspend, resume and shutdown.
 *
 * Quiescing an engine raises its suspended flag first, so every entry point
 * starts refusing work, then waits out whatever was already past that check:
 * the batch worker, the cipher messages in flight, and any synchronous
 * submit holding the server lock.
 */
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::SeDevice;
use crate::error::VseError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Suspended,
    /// Terminal.
    Shutdown,
}

pub(crate) struct PowerCoordinator {
    state: Mutex<PowerState>,
}

impl PowerCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PowerState::Running),
        }
    }

    pub fn state(&self) -> PowerState {
        *self.state.lock()
    }

    pub fn suspend(&self, devices: &[Arc<SeDevice>]) -> Result<(), VseError> {
        let mut state = self.state.lock();
        match *state {
            PowerState::Running => {}
            PowerState::Suspended => return Ok(()),
            PowerState::Shutdown => return Err(VseError::Suspended),
        }
        for dev in devices {
            quiesce(dev);
        }
        *state = PowerState::Suspended;
        info!(engines = devices.len(), "suspended");
        Ok(())
    }

    pub fn resume(&self, devices: &[Arc<SeDevice>]) -> Result<(), VseError> {
        let mut state = self.state.lock();
        match *state {
            PowerState::Suspended => {}
            PowerState::Running => return Ok(()),
            PowerState::Shutdown => {
                warn!("resume after shutdown");
                return Err(VseError::Suspended);
            }
        }
        for dev in devices {
            dev.set_suspended(false);
            if let Some(aes) = &dev.aes {
                // requests left queued by the suspend
                aes.restart();
            }
        }
        *state = PowerState::Running;
        info!(engines = devices.len(), "resumed");
        Ok(())
    }

    /// Quiesces every engine for good. Requests still queued are failed.
    pub fn shutdown(&self, devices: &[Arc<SeDevice>]) {
        let mut state = self.state.lock();
        if *state == PowerState::Shutdown {
            return;
        }
        for dev in devices {
            quiesce(dev);
            if let Some(aes) = &dev.aes {
                aes.fail_queued(VseError::Suspended);
            }
        }
        *state = PowerState::Shutdown;
        info!(engines = devices.len(), "shut down");
    }
}

fn quiesce(dev: &SeDevice) {
    dev.set_suspended(true);
    if let Some(aes) = &dev.aes {
        aes.flush();
        aes.wait_idle();
    }
    // a synchronous submit past its suspended check still holds this
    drop(dev.server_lock.lock());
    debug!(engine = dev.engine.id(), "engine quiesced");
}
