pub mod classifier;
pub mod shards;

pub use classifier::{AdminAccess, AdminSession, TopologyClassifier, TopologyVerdict};
pub use shards::{Shard, ShardDescriptor, ShardEnumerator};
