//! Block: a bundle of warps bound to one running kernel. Grounded in
//! `original_source/src/include/Block.hpp`/`SM.hpp`'s `Block` class; the
//! warps themselves stay owned by the SM's fixed `Vec<Warp>` (indexed by
//! `WarpId`), so a block here is just the binding plus its record.

use crate::ids::{BlockId, KernelId, SmId, WarpId};
use crate::request::BlockRecord;

pub struct Block {
    pub block_id: BlockId,
    pub kernel_id: KernelId,
    pub sm_id: SmId,
    pub warp_ids: Vec<WarpId>,
    pub record: BlockRecord,
}

impl Block {
    pub fn new(block_id: BlockId, kernel_id: KernelId, sm_id: SmId, start_cycle: u64) -> Self {
        Block {
            block_id,
            kernel_id,
            sm_id,
            warp_ids: Vec::new(),
            record: BlockRecord {
                block_id,
                sm_id,
                start_cycle,
                ..BlockRecord::default()
            },
        }
    }
}
