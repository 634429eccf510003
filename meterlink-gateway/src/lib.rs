pub mod batch;
pub mod collector;
pub mod config;
pub mod connectivity;
pub mod driver;
pub mod http;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod storage;
pub mod upload;
pub mod uplink;
mod util;

pub use batch::{BatchSizeController, BatchSizeState};
pub use collector::{CollectionOrchestrator, CycleError, CycleResult, ProtocolPools};
pub use config::{Config, DriverConfig, StorageConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityEventKind, ConnectivityMonitor};
pub use driver::mock::{MockDevice, MockDriver, MockFault};
pub use driver::modbus::ModbusTcpDriver;
pub use driver::{ChunkDescriptor, DeviceDriver, DeviceHandle, DriverError};
pub use pool::{ConnectionPool, PoolError, PoolStats, PooledConnection};
pub use registry::{DeviceRegistryCache, ReloadReport};
pub use resilience::{ErrorKind, RetryCoordinator, RetryError};
pub use storage::{GatewayStore, MemoryStore, SqliteStore, SyncLogEntry};
pub use upload::{SkipReason, UploadManager, UploadOutcome};
pub use uplink::{HttpUplinkClient, MockUplink, UplinkClient, UplinkError};
