#![cfg_attr(feature = "strict", deny(warnings))]

pub mod configuration_utils;
pub mod errors;
pub mod singleflight;

pub use configuration_utils::ParsableConfigValue;
pub use singleflight::SingleFlight;

// The configurable_constants! macro is exported at the crate root by #[macro_export].
