pub mod distributor;
pub mod processor;
pub mod transform;
