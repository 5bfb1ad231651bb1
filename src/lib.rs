// Factor analysis (FA)

#![doc = include_str!("../README.md")]

mod fa;
mod svd;

pub use fa::FactorAnalysis;
pub use svd::{DecompositionBackend, ExactSvd, RandomizedSvd, SvdMethod, TruncatedSvd};
