//! Block device discovery: MBR/GPT partition tables exposed as
//! character devices (spec §4.E).

pub mod gpt;
pub mod mbr;
pub mod partition;

pub use partition::{register_block_device, BlockDevice, Partition};
