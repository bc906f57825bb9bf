// Detection pipeline: job registry, workers and the live stream

pub mod annotate;
pub mod detection;
pub mod registry;
pub mod stream;
pub mod types;
pub mod worker;

#[cfg(test)]
pub mod testing;
