pub mod gateway;
#[cfg(test)]
pub mod testing;
pub mod vijson;
pub mod wire;
