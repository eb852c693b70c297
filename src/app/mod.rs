pub mod adb;
pub mod aya;
pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;

#[cfg(test)]
pub(crate) mod testing;
