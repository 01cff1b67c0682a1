// Shared fixtures for integration tests: an in-memory cluster, a
// publisher handle and a delivery collector.
use rocketspeed_common::Delivery;
use rocketspeed_router::LogRouter;
use rocketspeed_storage::MemoryLogStorage;
use rocketspeed_tower::{ControlTower, TowerOptions};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod publisher;
pub mod subscriber;

pub use publisher::Publisher;
pub use subscriber::DeliveryLog;

/// Initializes test logging; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A tower over in-memory storage with its deliveries auto-collected.
pub struct TestCluster {
    pub tower: ControlTower,
    pub storage: Arc<MemoryLogStorage>,
    pub router: Arc<LogRouter>,
    pub deliveries: DeliveryLog,
}

impl TestCluster {
    /// One log serves everything; handy when a scenario needs topics to
    /// share a log.
    pub fn start(options: TowerOptions) -> Self {
        Self::start_with_logs(options, 1)
    }

    pub fn start_with_logs(options: TowerOptions, num_logs: u64) -> Self {
        let (tower, storage, router, receivers) = start_raw(options, num_logs);
        let deliveries = DeliveryLog::collect(receivers);
        Self {
            tower,
            storage,
            router,
            deliveries,
        }
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.storage.clone(), self.router.clone())
    }
}

/// Builds a tower but hands the raw delivery receivers back, for tests
/// that model a slow consumer.
pub fn start_raw(
    options: TowerOptions,
    num_logs: u64,
) -> (
    ControlTower,
    Arc<MemoryLogStorage>,
    Arc<LogRouter>,
    Vec<mpsc::Receiver<Delivery>>,
) {
    init_tracing();
    let storage = Arc::new(MemoryLogStorage::new());
    let router = Arc::new(LogRouter::new(1, num_logs));
    let (tower, receivers) =
        ControlTower::new(options, storage.clone(), router.clone()).expect("start tower");
    (tower, storage, router, receivers)
}
