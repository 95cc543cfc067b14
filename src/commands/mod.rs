pub mod dfu;
pub mod settings;
