#[cfg(feature = "certserver")]
pub mod certserver;

#[cfg(feature = "unit")]
pub mod unit;
