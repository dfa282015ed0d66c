pub mod programs;
pub mod proxy;
