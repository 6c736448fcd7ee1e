pub mod fixed_buf;
pub mod pool;
