//! Partitions exposed as character devices.
//!
//! Grounded on `original_source/kernel/drivers/block.c`'s `register_blkdev`
//! / `partition_device_read` / `partition_device_write`: discover MBR
//! partitions first, fall back to a GPT presence check, then register
//! each partition as a char device named `{device_prefix}{minor}` whose
//! reads/writes are bounds-checked against `lba_cnt * blksize` and
//! translated into an offset on the underlying disk.

use super::gpt;
use super::mbr::{self, MbrPartition};
use crate::error::{KernelError, KResult};
use crate::task::fd::Asset;
use alloc::string::String;
use alloc::vec::Vec;

/// The underlying whole-disk device a partition reads/writes through.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> u64;
    fn read_blocks(&self, lba: u64, buffer: &mut [u8]) -> KResult<()>;
    fn write_blocks(&self, lba: u64, buffer: &[u8]) -> KResult<()>;
}

pub struct Partition {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub lba_start: u64,
    pub lba_cnt: u64,
}

/// The char-device-facing handle for one partition: reads/writes are
/// offset by `lba_start * block_size` onto the owning disk and bounds
/// checked against `lba_cnt * block_size` before being issued.
pub struct PartitionAsset<D: BlockDevice> {
    disk: alloc::sync::Arc<D>,
    partition: Partition,
}

impl<D: BlockDevice> PartitionAsset<D> {
    fn bounds_check(&self, offset: u64, len: u64) -> KResult<()> {
        let limit = self.partition.lba_cnt * self.disk.block_size();
        if offset + len > limit {
            return Err(KernelError::InvalidRange);
        }
        Ok(())
    }

    fn disk_offset(&self, offset: u64) -> u64 {
        self.partition.lba_start * self.disk.block_size() + offset
    }
}

impl<D: BlockDevice> Asset for PartitionAsset<D> {
    fn read(&self, position: u64, buffer: &mut [u8]) -> KResult<usize> {
        self.bounds_check(position, buffer.len() as u64)?;
        let blksize = self.disk.block_size();
        let abs = self.disk_offset(position);
        debug_assert_eq!(abs % blksize, 0, "unaligned partition read unsupported");
        self.disk.read_blocks(abs / blksize, buffer)?;
        Ok(buffer.len())
    }

    fn write(&self, position: u64, buffer: &[u8]) -> KResult<usize> {
        self.bounds_check(position, buffer.len() as u64)?;
        let blksize = self.disk.block_size();
        let abs = self.disk_offset(position);
        debug_assert_eq!(abs % blksize, 0, "unaligned partition write unsupported");
        self.disk.write_blocks(abs / blksize, buffer)?;
        Ok(buffer.len())
    }
}

/// `register_blkdev` (spec §4.E): read sector 0, try MBR; on failure read
/// sector 1 and check for a GPT header; if neither is present, return no
/// partitions. Every discovered MBR partition becomes a named char device
/// `{device_prefix}{minor}`, minors starting at `first_minor`.
pub fn register_block_device<D: BlockDevice>(
    disk: alloc::sync::Arc<D>,
    device_prefix: &str,
    major: u32,
    first_minor: u32,
) -> KResult<Vec<PartitionAsset<D>>> {
    let blksize = disk.block_size() as usize;
    let mut sector0 = alloc::vec![0u8; blksize];
    disk.read_blocks(0, &mut sector0)?;

    let mbr_partitions: Option<Vec<MbrPartition>> = mbr::parse(&sector0);

    let mbr_partitions = match mbr_partitions {
        Some(p) => p,
        None => {
            let mut sector1 = alloc::vec![0u8; blksize];
            disk.read_blocks(1, &mut sector1)?;
            if gpt::is_present(&sector1) {
                return Ok(Vec::new());
            }
            return Err(KernelError::NoPartitions);
        }
    };

    let mut assets = Vec::new();
    for (minor, mbr_partition) in (first_minor..).zip(mbr_partitions) {
        let name = alloc::format!("{}{}", device_prefix, minor);
        assets.push(PartitionAsset {
            disk: disk.clone(),
            partition: Partition {
                name,
                major,
                minor,
                lba_start: mbr_partition.lba_start as u64,
                lba_cnt: mbr_partition.lba_cnt as u64,
            },
        });
    }

    Ok(assets)
}
