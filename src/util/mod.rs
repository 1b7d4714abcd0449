pub mod log_util;
pub mod shared_types;
pub mod tests;
