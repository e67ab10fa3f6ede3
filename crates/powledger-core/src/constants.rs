pub const BYTE: usize = 8;
pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;
pub const DEFAULT_DIFFICULTY: u32 = 5;
pub const DEFAULT_BLOCK_CAP: usize = 20;
pub const DEFAULT_POW_WIDTH: usize = 32;
pub const MAX_SIM_AMOUNT: u64 = 200;
pub const BLOCK_LOG_TARGET: &str = "powledger::blocks";
