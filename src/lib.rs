/*
 * Client for the virtualized security engine (VSE).
 *
 * A guest reaches the engine's partition over one inter-VM channel shared
 * by three engines: AES0 runs CMAC, AES1 runs the block ciphers and owns
 * the batching queue, and the SHA engine runs the hashes. `Vse` is the
 * driver context tying them to the channel, the completion dispatcher and
 * the power coordinator.
 */
#![doc = include_str!("../README.md")]

use std::sync::Arc;

use anyhow::{bail, Context};
use common::ivc::{IVC_MSG_SIZE, SHA_MAX_BLOCK_SIZE};
use tracing::info;

pub mod aes;
pub mod cmac;
pub mod config;
mod debug;
mod device;
mod dispatcher;
pub mod dma;
pub mod emulator;
pub mod error;
pub mod ivc;
pub mod keyslot;
mod pending;
pub mod power;
pub mod sg;
pub mod sha;
mod sync;

pub use self::aes::{
    AesMode, AesSession, CipherCallback, CipherDone, CipherEvent, CipherRequest, Enqueued,
};
pub use common::ivc::Engine;
pub use cmac::{CmacRequest, CmacSession};
pub use config::{probe_device_tree, ProbeConfig, Timeouts, VSE_COMPATIBLE};
pub use dma::{DmaBuffer, DmaSpace};
pub use emulator::{Emulator, EmulatorConfig, LoggedMsg, LoopbackChannel};
pub use error::VseError;
pub use ivc::{IrqHandler, IvcChannel};
pub use power::PowerState;
pub use sg::ScatterList;
pub use sha::{ShaAlg, ShaRequest, ShaSession, ShaState};

use config::SHA_BUFFER_SIZE;
use device::{Core, SeDevice};
use dispatcher::Dispatcher;
use ivc::IvcTransport;
use pending::{MsgPool, PendingTable};
use power::PowerCoordinator;

/// Algorithm names an engine registers.
pub fn algorithms(engine: Engine) -> Vec<&'static str> {
    match engine {
        Engine::Aes0 => vec!["cmac(aes)"],
        Engine::Aes1 => AesMode::ALL.iter().map(|m| m.name()).collect(),
        Engine::Sha => ShaAlg::ALL.iter().map(|a| a.name()).collect(),
    }
}

pub struct VseBuilder {
    channel: Arc<dyn IvcChannel>,
    dma: Arc<DmaSpace>,
    timeouts: Timeouts,
    sha_buffer_size: usize,
    configs: Vec<ProbeConfig>,
}

impl VseBuilder {
    pub fn new(channel: Arc<dyn IvcChannel>, dma: Arc<DmaSpace>) -> Self {
        Self {
            channel,
            dma,
            timeouts: Timeouts::default(),
            sha_buffer_size: SHA_BUFFER_SIZE,
            configs: Vec::new(),
        }
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Size of each hash request's scratch buffer. Rounded down to a whole
    /// number of the largest hash block.
    pub fn sha_buffer_size(mut self, size: usize) -> Self {
        self.sha_buffer_size = size;
        self
    }

    /// Adds one engine instance. Instances are brought up in the order added.
    pub fn probe(mut self, config: ProbeConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Adds every engine instance described in a device tree blob.
    pub fn device_tree(mut self, blob: &[u8]) -> anyhow::Result<Self> {
        self.configs.extend(probe_device_tree(blob)?);
        Ok(self)
    }

    pub fn build(self) -> anyhow::Result<Vse> {
        if self.configs.is_empty() {
            bail!("no engine to probe");
        }
        let frame_size = self.channel.frame_size();
        if frame_size < IVC_MSG_SIZE {
            bail!("channel frame of {frame_size} bytes cannot carry a {IVC_MSG_SIZE}-byte message");
        }
        let sha_buffer_size = self.sha_buffer_size / SHA_MAX_BLOCK_SIZE * SHA_MAX_BLOCK_SIZE;
        if sha_buffer_size < 2 * SHA_MAX_BLOCK_SIZE {
            bail!("hash scratch buffer of {} bytes is too small", self.sha_buffer_size);
        }

        // the first instance owns the channel
        let ivc_id = self.configs.first().and_then(|cfg| cfg.ivc_id);

        let core = Arc::new(Core {
            transport: IvcTransport::new(self.channel, self.timeouts),
            pending: PendingTable::new(),
            msgs: MsgPool::new(),
            dma: self.dma,
            timeouts: self.timeouts,
            sha_buffer_size,
        });
        let dispatcher = Dispatcher::start(core.clone()).context("starting the dispatcher")?;

        let mut devices: [Option<Arc<SeDevice>>; 3] = Default::default();
        for cfg in &self.configs {
            let slot = &mut devices[cfg.engine.index()];
            if slot.is_some() {
                bail!("{}: engine {} probed twice", cfg.name, cfg.engine.id());
            }
            let dev = SeDevice::new(cfg, core.clone())
                .with_context(|| format!("{}: starting engine {}", cfg.name, cfg.engine.id()))?;
            info!(
                engine = cfg.engine.id(),
                algorithms = ?algorithms(cfg.engine),
                "engine registered"
            );
            *slot = Some(dev);
        }

        Ok(Vse {
            core,
            devices,
            ivc_id,
            power: PowerCoordinator::new(),
            dispatcher: Some(dispatcher),
        })
    }
}

/// The driver context.
pub struct Vse {
    core: Arc<Core>,
    devices: [Option<Arc<SeDevice>>; 3],
    ivc_id: Option<u32>,
    power: PowerCoordinator,
    dispatcher: Option<Dispatcher>,
}

impl Vse {
    fn device(&self, engine: Engine) -> Result<Arc<SeDevice>, VseError> {
        let dev = self.devices[engine.index()]
            .clone()
            .ok_or(VseError::NoDevice)?;
        dev.check_running()?;
        Ok(dev)
    }

    fn probed(&self) -> Vec<Arc<SeDevice>> {
        self.devices.iter().flatten().cloned().collect()
    }

    pub fn aes(&self, mode: AesMode) -> Result<AesSession, VseError> {
        Ok(AesSession::new(self.device(Engine::Aes1)?, mode))
    }

    pub fn sha(&self, alg: ShaAlg) -> Result<ShaSession, VseError> {
        Ok(ShaSession::new(self.device(Engine::Sha)?, alg))
    }

    pub fn cmac(&self) -> Result<CmacSession, VseError> {
        Ok(CmacSession::new(self.device(Engine::Aes0)?))
    }

    /// Channel id named by the first probed instance.
    pub fn ivc_id(&self) -> Option<u32> {
        self.ivc_id
    }

    pub fn engines(&self) -> Vec<Engine> {
        self.devices.iter().flatten().map(|dev| dev.engine).collect()
    }

    pub fn registered_algorithms(&self) -> Vec<&'static str> {
        self.engines().into_iter().flat_map(algorithms).collect()
    }

    /// Requests sent and still waiting for their response.
    pub fn outstanding(&self) -> usize {
        self.core.pending.outstanding()
    }

    /// Cipher batch messages in flight.
    pub fn inflight_batches(&self) -> usize {
        self.devices[Engine::Aes1.index()]
            .as_ref()
            .and_then(|dev| dev.aes.as_ref())
            .map_or(0, |aes| aes.inflight())
    }

    /// Cipher requests queued and not yet batched.
    pub fn queued_requests(&self) -> usize {
        self.devices[Engine::Aes1.index()]
            .as_ref()
            .and_then(|dev| dev.aes.as_ref())
            .map_or(0, |aes| aes.queued())
    }

    pub fn power_state(&self) -> PowerState {
        self.power.state()
    }

    pub fn suspend(&self) -> Result<(), VseError> {
        self.power.suspend(&self.probed())
    }

    pub fn resume(&self) -> Result<(), VseError> {
        self.power.resume(&self.probed())
    }

    pub fn shutdown(&self) {
        self.power.shutdown(&self.probed());
    }
}

impl Drop for Vse {
    fn drop(&mut self) {
        let devices = self.probed();
        self.power.shutdown(&devices);
        for dev in &devices {
            if let Some(aes) = &dev.aes {
                aes.stop();
            }
        }
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.stop();
        }
        info!("driver torn down");
    }
}
