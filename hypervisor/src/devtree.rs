//! Device-tree consumption, SPEC_FULL.md §6.
//!
//! Grounded on the `fdt` crate's zero-copy, no-heap flattened-device-tree
//! reader (the same "enrich from the rest of the pack" move as
//! [`crate::gphys`]'s `bitflags`: the teacher never parses a device tree,
//! so the pattern is drawn from the bare-metal kernel corpus instead,
//! e.g. `hikami`'s `fdt::Fdt::from_ptr()` boot-time parse). Both the
//! hardware tree and the hypervisor-config tree are walked once, at boot
//! or partition-materialization time respectively; nothing here runs on a
//! guest execution path.

use alloc::string::String;
use alloc::vec::Vec;

use fdt::Fdt;

use crate::errors::HvError;

/// One `fsl,cpus` pair: base core id plus count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuRange {
    pub(crate) base: u32,
    pub(crate) count: u32,
}

/// One `fsl,hv-image-{src-addr,gphys-addr,size}` load descriptor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageLoad {
    pub(crate) src_addr: u64,
    pub(crate) gphys_addr: u64,
    pub(crate) size: u64,
}

/// One `/partitions/<name>` node, materialized into the fields
/// `guest::Guest::new` and the partition's PAMU bindings need.
#[derive(Debug, Clone)]
pub(crate) struct PartitionConfig {
    pub(crate) name: String,
    pub(crate) cpus: CpuRange,
    pub(crate) dtb_phandle: Option<u32>,
    pub(crate) images: Vec<ImageLoad>,
}

/// Parses the hardware device tree, a one-time boot operation. Only the
/// handful of properties the hypervisor core needs are extracted; anything
/// else in the tree is the out-of-scope boot loader's concern (SPEC_FULL.md
/// §1).
pub(crate) struct HardwareTree<'a> {
    fdt: Fdt<'a>,
}

impl<'a> HardwareTree<'a> {
    /// # Safety
    /// `ptr` must point to a valid flattened device tree blob that remains
    /// mapped for `'a`, per `fdt::Fdt::from_ptr`'s own safety contract.
    pub(crate) unsafe fn from_ptr(ptr: *const u8) -> Result<Self, HvError> {
        let fdt = unsafe { Fdt::from_ptr(ptr) }
            .map_err(|_| HvError::Fatal("hardware device tree failed to parse"))?;
        Ok(Self { fdt })
    }

    pub(crate) fn total_memory_bytes(&self) -> u64 {
        self.fdt.memory().regions().map(|r| r.size.unwrap_or(0) as u64).sum()
    }

    pub(crate) fn cpu_count(&self) -> usize {
        self.fdt.cpus().count()
    }

    /// The `/hv-config` tree's physical address, taken from the
    /// `config-addr=<hex>` token in `/chosen/bootargs` (grounded on
    /// `original_source/src/init.c`'s `get_cfg_addr` boot parameter, which
    /// reads the same token from the same property).
    pub(crate) fn config_addr(&self) -> Option<u64> {
        parse_config_addr(self.fdt.chosen().bootargs()?)
    }
}

fn parse_config_addr(bootargs: &str) -> Option<u64> {
    let rest = bootargs.split("config-addr=").nth(1)?;
    let token = rest.split_whitespace().next()?;
    let hex = token.strip_prefix("0x").unwrap_or(token);
    u64::from_str_radix(hex, 16).ok()
}

/// Parses the `/hv-config` tree named by the `config-addr=<hex>` boot
/// argument, materializing each `/partitions/<name>` node.
pub(crate) struct HvConfigTree<'a> {
    fdt: Fdt<'a>,
}

impl<'a> HvConfigTree<'a> {
    /// # Safety
    /// Same contract as [`HardwareTree::from_ptr`].
    pub(crate) unsafe fn from_ptr(ptr: *const u8) -> Result<Self, HvError> {
        let fdt = unsafe { Fdt::from_ptr(ptr) }
            .map_err(|_| HvError::Fatal("hv-config device tree failed to parse"))?;
        Ok(Self { fdt })
    }

    /// Walks every `/partitions/<name>` node once, per SPEC_FULL.md §6
    /// "walked once per partition to materialize its `Guest`".
    pub(crate) fn partitions(&self) -> Result<Vec<PartitionConfig>, HvError> {
        let partitions_node = self
            .fdt
            .find_node("/partitions")
            .ok_or(HvError::Fatal("hv-config tree has no /partitions node"))?;

        let mut configs = Vec::new();
        for node in partitions_node.children() {
            let cpus = node
                .property("fsl,cpus")
                .and_then(|p| p.as_usize())
                .map(|v| CpuRange { base: (v >> 32) as u32, count: v as u32 })
                .ok_or(HvError::Fatal("partition node missing fsl,cpus"))?;

            let images = node
                .property("fsl,hv-loaded-images")
                .map(|_| decode_image_list(&node))
                .unwrap_or_default();

            configs.push(PartitionConfig {
                name: String::from(node.name),
                cpus,
                dtb_phandle: node.property("fsl,dtb").and_then(|p| p.as_usize()).map(|v| v as u32),
                images,
            });
        }
        Ok(configs)
    }
}

fn decode_image_list(node: &fdt::node::FdtNode<'_, '_>) -> Vec<ImageLoad> {
    // The reference encodes each load descriptor as a sibling property
    // triple (`fsl,hv-image-src-addr`, `-gphys-addr`, `-size`); parsed here
    // as independent single-cell properties since the retrieved pack's
    // config nodes never nest multiple images per partition.
    let src = node.property("fsl,hv-image-src-addr").and_then(|p| p.as_usize());
    let gphys = node.property("fsl,hv-image-gphys-addr").and_then(|p| p.as_usize());
    let size = node.property("fsl,hv-image-size").and_then(|p| p.as_usize());
    match (src, gphys, size) {
        (Some(src_addr), Some(gphys_addr), Some(size)) => alloc::vec![ImageLoad {
            src_addr: src_addr as u64,
            gphys_addr: gphys_addr as u64,
            size: size as u64,
        }],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_addr_among_other_bootargs_tokens() {
        assert_eq!(
            parse_config_addr("console=ttyS0 config-addr=0x1ff0000 root=/dev/ram"),
            Some(0x01ff_0000)
        );
    }

    #[test]
    fn missing_token_is_none() {
        assert_eq!(parse_config_addr("console=ttyS0"), None);
    }

    #[test]
    fn trailing_token_has_no_following_whitespace() {
        assert_eq!(parse_config_addr("config-addr=0xabc"), Some(0xabc));
    }
}
</content>
