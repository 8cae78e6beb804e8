pub mod constants;
pub mod types;
pub mod frame;
pub mod transport;
pub mod store;
pub mod session;
pub mod btle;

#[cfg(test)]
mod mock;
