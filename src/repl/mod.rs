// Replication: the leader-side relay and the follower.

pub mod follower;
pub mod leader;
