//! Fixed operational caps. These bound single requests; tunable knobs
//! live in [`crate::config::Config`].

pub const MAX_BATCH_SIZE: usize = 500;
pub const MAX_RANDOM_PICK: usize = 50;
pub const MAX_KEY_LEN: usize = 20;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_REQUESTER_LEN: usize = 255;
pub const MAX_REFERENCE_LEN: usize = 255;
pub const MAX_NUMBERS: usize = 1_000_000;
