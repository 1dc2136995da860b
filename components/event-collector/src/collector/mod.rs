pub mod cycle;
pub mod filter;
pub mod normalizer;
pub mod paginator;
