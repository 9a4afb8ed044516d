//! Container management module
//!
//! Container records, their state machine and the lifecycle manager that
//! drives them through the runtime.

mod archive;
mod checkpoint;
mod commit;
pub mod config;
mod exec;
pub mod filter;
mod logs;
mod manager;
pub mod meta;
pub mod monitor;
pub mod registry;
pub mod state;
mod upgrade;

pub use archive::{ArchiveStream, PathStat};
pub use checkpoint::CheckpointOptions;
pub use config::{
    ContainerConfig, DeviceMapping, HostConfig, LogConfig, Resources, RestartPolicy,
    ThrottleDevice, WeightDevice,
};
pub use exec::{ExecConfig, ExecRecord, EXEC_FAILED_EXIT_CODE};
pub use filter::{match_kv_list, Filters};
pub use logs::{LogMessage, LogsOptions};
pub use manager::{ContainerManager, CreateResponse, ManagerDeps, UpdateConfig, WaitResult};
pub use meta::{Container, ContainerMeta, Exported, MountPoint, Propagation};
pub use monitor::{EventHandler, Monitor, MonitorEvent};
pub use registry::Registry;
pub use state::{State, Status, StatusFlags};
pub use upgrade::UpgradeConfig;
