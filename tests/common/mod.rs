//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{Behavior, RecordingTaskType, TestCluster};
//!
//! #[tokio::test]
//! async fn test_leader_runs_due_task() {
//!     let cluster = TestCluster::new();
//!     let audit = RecordingTaskType::new("audit", Behavior::Succeed);
//!     cluster.seed_task("audit", "tenant-a", "example.org", 3600);
//!
//!     let node = cluster.spawn_node("a", vec![audit.clone()]).await;
//!     assert!(common::wait_until(|| audit.executions() == 1).await);
//!     node.stop().await;
//! }
//! ```

mod cluster;
mod fixtures;

// Public API - this is what tests import
pub use cluster::{TestCluster, TestNode};
pub use fixtures::{Behavior, RecordingTaskType};

use std::time::Duration;

/// Poll `condition` every 10ms for up to 5 seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
