//! Nordic Secure DFU and Legacy DFU client for Bluetooth LE peripherals.

pub mod commands;
pub mod dfu;
pub mod settings;

#[cfg(test)]
mod test_helpers;
