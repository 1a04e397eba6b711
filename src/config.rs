/*
 * Probe-time configuration. Engine instances are described in a flattened
 * device tree: each node compatible with `VSE_COMPATIBLE` names one engine
 * through `se-engine-id`, the first one also carries the `ivc` channel id,
 * and `disable-keyslot-label` turns off label key material.
 */
use std::time::Duration;

use anyhow::{anyhow, Context};
use common::ivc::Engine;
use fdt_rs::{
    base::{DevTree, DevTreeNode},
    prelude::{FallibleIterator, PropReader},
};
use zerocopy::IntoBytes;

pub const VSE_COMPATIBLE: &str = "nvidia,tegra194-hv-vse-safety";

/// Scratch buffer size used by the SHA slow path.
pub const SHA_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub name: String,
    pub engine: Engine,
    /// Channel id. Only the first probed instance uses it.
    pub ivc_id: Option<u32>,
    pub disable_keyslot_label: bool,
}

impl ProbeConfig {
    pub fn from_fdt_node(node: &DevTreeNode) -> anyhow::Result<Self> {
        let name = node.name().unwrap_or("").to_string();
        let mut engine_id = None;
        let mut ivc_id = None;
        let mut disable_keyslot_label = false;
        for prop in node.props().iterator() {
            let prop = prop.map_err(|e| anyhow!("{name}: reading properties: {e:?}"))?;
            let cell = |what: &str| {
                prop.u32(0)
                    .map_err(|e| anyhow!("{name}: {what} is not a u32 cell: {e:?}"))
            };
            match prop.name().unwrap_or("") {
                "se-engine-id" if engine_id.is_none() => engine_id = Some(cell("se-engine-id")?),
                "ivc" if ivc_id.is_none() => ivc_id = Some(cell("ivc")?),
                "disable-keyslot-label" => disable_keyslot_label = true,
                _ => {}
            }
        }

        let engine_id = engine_id.ok_or_else(|| anyhow!("{name}: missing se-engine-id"))?;
        let engine = Engine::from_id(engine_id)
            .ok_or_else(|| anyhow!("{name}: unknown engine id {engine_id}"))?;
        Ok(Self {
            name,
            engine,
            ivc_id,
            disable_keyslot_label,
        })
    }
}

/// Collects the engine instances of a device tree blob in tree order.
pub fn probe_device_tree(blob: &[u8]) -> anyhow::Result<Vec<ProbeConfig>> {
    // the structure block is read in u32 cells
    let mut cells = vec![0u32; blob.len().div_ceil(4)];
    cells.as_mut_slice().as_mut_bytes()[..blob.len()].copy_from_slice(blob);
    let buf = &cells.as_slice().as_bytes()[..blob.len()];

    let fdt = unsafe { DevTree::new(buf) }.map_err(|e| anyhow!("bad device tree: {e:?}"))?;
    let mut configs = Vec::new();
    let mut nodes = fdt.compatible_nodes(VSE_COMPATIBLE);
    while let Some(node) = nodes
        .next()
        .map_err(|e| anyhow!("walking the device tree: {e:?}"))?
    {
        configs.push(ProbeConfig::from_fdt_node(&node).context("parsing an engine node")?);
    }
    Ok(configs)
}

/// Wait ceilings. The send/poll ceiling is counted in polls of `poll_interval`.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub channel_polls: u32,
    pub poll_interval: Duration,
    pub completion: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            channel_polls: 1_000_000,
            poll_interval: Duration::from_micros(1),
            completion: Duration::from_secs(10),
        }
    }
}
