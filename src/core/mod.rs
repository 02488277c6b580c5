pub mod anomaly;
pub mod connections;
pub mod random;
pub mod sdr;
pub mod serialization;
pub mod synapses;
pub mod temporal_memory;
pub mod topology;
