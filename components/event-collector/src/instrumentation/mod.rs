#[cfg(test)]
pub mod testing;
pub mod tracing;
