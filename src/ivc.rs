/*
 * Inter-VM channel transport.
 *
 * One fixed-size frame moves in each direction at a time. Senders are
 * serialized by a single lock across the whole driver; readiness waits are
 * bounded busy-polls since the channel handshake has no interrupt.
 */
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::ivc::IVC_MSG_SIZE;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::config::Timeouts;
use crate::error::{VseError, EIO};

pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// A shared-memory channel to the security engine partition.
pub trait IvcChannel: Send + Sync {
    /// Largest frame the channel carries.
    fn frame_size(&self) -> usize;

    /// False while the channel reset handshake is still in progress.
    fn is_established(&self) -> bool;

    fn can_write(&self) -> bool;

    fn can_read(&self) -> bool;

    /// Writes one frame. Errors carry the channel's negative errno.
    fn write(&self, frame: &[u8]) -> Result<usize, i32>;

    /// Reads one frame into `frame`, returning its length.
    fn read(&self, frame: &mut [u8]) -> Result<usize, i32>;

    /// Installs the handler run whenever the peer signals the channel.
    fn set_irq_handler(&self, handler: IrqHandler);
}

fn udelay(d: Duration) {
    let until = Instant::now() + d;
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

pub struct IvcTransport {
    channel: Arc<dyn IvcChannel>,
    lock: Mutex<()>,
    timeouts: Timeouts,
}

impl IvcTransport {
    pub fn new(channel: Arc<dyn IvcChannel>, timeouts: Timeouts) -> Self {
        Self {
            channel,
            lock: Mutex::new(()),
            timeouts,
        }
    }

    pub fn channel(&self) -> &Arc<dyn IvcChannel> {
        &self.channel
    }

    fn poll_until(&self, what: &str, ready: impl Fn() -> bool) -> Result<(), VseError> {
        let mut polls = self.timeouts.channel_polls;
        while !ready() {
            if polls == 0 {
                error!("timed out waiting for {what}");
                return Err(VseError::ChannelTimeout);
            }
            polls -= 1;
            udelay(self.timeouts.poll_interval);
        }
        Ok(())
    }

    /// Sends one frame. Only one sender is on the channel at any instant.
    pub fn send(&self, frame: &[u8]) -> Result<(), VseError> {
        let _guard = self.lock.lock();

        self.poll_until("channel reset", || self.channel.is_established())?;
        self.poll_until("channel write space", || self.channel.can_write())?;

        if frame.len() > IVC_MSG_SIZE || frame.len() > self.channel.frame_size() {
            error!(len = frame.len(), "message too large for the channel");
            return Err(VseError::MessageTooLarge(frame.len()));
        }

        match self.channel.write(frame) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(n) => {
                error!(written = n, len = frame.len(), "short channel write");
                Err(VseError::Transport(-EIO))
            }
            Err(code) => {
                error!(code, "channel write failed");
                Err(VseError::Transport(code))
            }
        }
    }

    /// Drains every readable frame into `handle`. Frames that are not exactly
    /// one message long are logged and skipped. Returns the number handled.
    pub fn poll_and_receive(
        &self,
        frame: &mut [u8],
        mut handle: impl FnMut(&[u8]),
    ) -> Result<usize, VseError> {
        self.poll_until("channel reset", || self.channel.is_established())?;

        let mut handled = 0;
        while self.channel.can_read() {
            match self.channel.read(frame) {
                Ok(IVC_MSG_SIZE) => {
                    handle(&frame[..IVC_MSG_SIZE]);
                    handled += 1;
                }
                Ok(len) => {
                    warn!(len, expected = IVC_MSG_SIZE, "dropping malformed frame");
                }
                Err(code) => {
                    error!(code, "channel read failed");
                    return Err(VseError::Transport(code));
                }
            }
        }
        Ok(handled)
    }
}
