pub mod service;
pub mod store;
pub mod types;

pub use service::{
    LoggingRemediator, PermissionRemediator, PermissionSource, RecordingRemediator,
    StaticPermissions,
};
pub use store::JsonPermissionSource;
pub use types::{Permission, PermissionState};
