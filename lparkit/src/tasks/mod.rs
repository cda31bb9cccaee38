//! Lifecycle tasks for the flow engine.
//!
//! - `vm` - Partition create/resize/rename/power/delete and NVRAM tasks
//! - `storage` - Storage coordinator execution and config drive media tasks

pub mod storage;
pub mod vm;

pub use storage::{CreateAndConnectCfgDrive, DeleteVOpt, ExecuteStorageFeed};
pub use vm::{
    CREATE_SCRUBBER, Create, Delete, DeleteNvram, Get, PowerOff, PowerOn, Rename, Resize,
    StoreNvram, UpdateIBMiSettings,
};
