//! Test harness: in-memory southbound, sample descriptors and the simulator

pub mod simulator;
pub mod southbound;

pub use simulator::{run_simulator, SimulatorConfig, SimulatorReport, SimulatorStats};
pub use southbound::{
    bridge_key, leaf_key, Bridge, BridgeDescriptor, Leaf, LeafDescriptor, MemorySouthbound,
    SbIndex, SouthboundError,
};
