//! Minimal flattened device tree writer: one root node with flat children.

use std::mem::size_of;

use zerocopy::big_endian::{U32, U64};
use zerocopy::{Immutable, IntoBytes, KnownLayout};

const MAGIC: u32 = 0xd00d_feed;
const VERSION: u32 = 17;
const LAST_COMP_VERSION: u32 = 16;

const BEGIN_NODE: u32 = 1;
const END_NODE: u32 = 2;
const PROP: u32 = 3;
const END: u32 = 9;

#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout)]
struct Header {
    magic: U32,
    totalsize: U32,
    off_dt_struct: U32,
    off_dt_strings: U32,
    off_mem_rsvmap: U32,
    version: U32,
    last_comp_version: U32,
    boot_cpuid_phys: U32,
    size_dt_strings: U32,
    size_dt_struct: U32,
}

#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout)]
struct ReserveEntry {
    address: U64,
    size: U64,
}

#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout)]
struct PropHeader {
    len: U32,
    nameoff: U32,
}

/// A child of the root node.
#[derive(Clone, Debug)]
pub struct FdtNode {
    name: String,
    props: Vec<(String, Vec<u8>)>,
}

impl FdtNode {
    pub fn new(name: &str, compatible: &str) -> Self {
        let mut compat = compatible.as_bytes().to_vec();
        compat.push(0);
        Self {
            name: name.into(),
            props: vec![("compatible".into(), compat)],
        }
    }

    pub fn with_u32(mut self, name: &str, value: u32) -> Self {
        self.props.push((name.into(), value.to_be_bytes().to_vec()));
        self
    }

    pub fn with_flag(mut self, name: &str) -> Self {
        self.props.push((name.into(), Vec::new()));
        self
    }
}

#[derive(Default)]
struct Strings {
    table: Vec<u8>,
    offsets: Vec<(String, u32)>,
}

impl Strings {
    fn offset(&mut self, name: &str) -> u32 {
        if let Some(&(_, off)) = self.offsets.iter().find(|(n, _)| n == name) {
            return off;
        }
        let off = self.table.len() as u32;
        self.table.extend_from_slice(name.as_bytes());
        self.table.push(0);
        self.offsets.push((name.into(), off));
        off
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn align(out: &mut Vec<u8>) {
    out.resize(out.len().next_multiple_of(4), 0);
}

fn begin_node(out: &mut Vec<u8>, name: &str) {
    push_u32(out, BEGIN_NODE);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    align(out);
}

/// Serializes `nodes` as children of an empty root node.
pub fn build(nodes: &[FdtNode]) -> Vec<u8> {
    let mut strings = Strings::default();
    let mut structs = Vec::new();
    begin_node(&mut structs, "");
    for node in nodes {
        begin_node(&mut structs, &node.name);
        for (name, value) in &node.props {
            push_u32(&mut structs, PROP);
            let header = PropHeader {
                len: U32::new(value.len() as u32),
                nameoff: U32::new(strings.offset(name)),
            };
            structs.extend_from_slice(header.as_bytes());
            structs.extend_from_slice(value);
            align(&mut structs);
        }
        push_u32(&mut structs, END_NODE);
    }
    push_u32(&mut structs, END_NODE);
    push_u32(&mut structs, END);

    let off_mem_rsvmap = size_of::<Header>();
    let off_dt_struct = off_mem_rsvmap + size_of::<ReserveEntry>();
    let off_dt_strings = off_dt_struct + structs.len();
    let totalsize = off_dt_strings + strings.table.len();
    let header = Header {
        magic: MAGIC.into(),
        totalsize: (totalsize as u32).into(),
        off_dt_struct: (off_dt_struct as u32).into(),
        off_dt_strings: (off_dt_strings as u32).into(),
        off_mem_rsvmap: (off_mem_rsvmap as u32).into(),
        version: VERSION.into(),
        last_comp_version: LAST_COMP_VERSION.into(),
        boot_cpuid_phys: U32::ZERO,
        size_dt_strings: (strings.table.len() as u32).into(),
        size_dt_struct: (structs.len() as u32).into(),
    };
    let terminator = ReserveEntry {
        address: U64::ZERO,
        size: U64::ZERO,
    };

    let mut blob = Vec::with_capacity(totalsize);
    blob.extend_from_slice(header.as_bytes());
    blob.extend_from_slice(terminator.as_bytes());
    blob.extend_from_slice(&structs);
    blob.extend_from_slice(&strings.table);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_points_at_each_block() {
        let blob = build(&[FdtNode::new("a", "x,y").with_u32("id", 3)]);
        let word = |at: usize| u32::from_be_bytes(blob[at..at + 4].try_into().unwrap());
        assert_eq!(word(0), MAGIC);
        assert_eq!(word(4) as usize, blob.len());
        assert_eq!(word(8), 56);
        assert_eq!(word(16), 40);
        let strings = word(12) as usize;
        assert_eq!(&blob[strings..], b"compatible\0id\0");
    }
}
