//! GPT header presence check.
//!
//! Grounded on `original_source/kernel/drivers/block.c`'s
//! `register_gpt_partitions`: only the 8-byte `"EFI PART"` signature at
//! the start of LBA 1 is checked. Decoding the partition entry array is
//! out of scope (spec §1/§9) — finding a valid header is itself treated
//! as success, matching the original's behavior of returning `0` (and
//! therefore leaving the disk's partition list untouched) the moment the
//! signature matches.

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// Does the second sector of this disk carry a valid GPT header?
pub fn is_present(second_sector: &[u8]) -> bool {
    second_sector.len() >= 8 && &second_sector[0..8] == GPT_SIGNATURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_signature() {
        let mut sector = alloc::vec![0u8; 512];
        sector[0..8].copy_from_slice(GPT_SIGNATURE);
        assert!(is_present(&sector));
    }

    #[test]
    fn rejects_garbage() {
        let sector = alloc::vec![0u8; 512];
        assert!(!is_present(&sector));
    }
}
