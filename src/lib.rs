#![allow(
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]

pub mod cache;
pub mod conditions;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod factors;
pub mod live;
pub mod persist;
pub mod strategy;
#[doc(hidden)]
pub mod testutil;
pub mod util;
pub mod warmer;
