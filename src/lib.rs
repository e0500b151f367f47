#![doc = include_str!("../README.md")]

mod common;
mod error;
mod pool;
mod worker;

pub use crate::{
    common::{common, configure_common},
    error::Error,
    pool::{Builder, Pool},
};

/// Get a builder for creating a customized [`Pool`].
///
/// Shorthand for [`Pool::builder`].
#[inline]
pub fn builder() -> Builder {
    Pool::builder()
}
