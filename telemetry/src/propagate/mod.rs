#[cfg(feature = "tonic")]
pub mod tonic;

#[cfg(feature = "reqwest")]
pub mod reqwest;

#[cfg(feature = "axum")]
pub mod axum;
