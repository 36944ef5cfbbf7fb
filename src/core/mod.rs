pub mod error;
pub mod types;

pub use error::{BackupError, ErrorKind, Result};
pub use types::{
    BackendKind, BackupKind, BackupRecord, CommittedDelta, CrashRecord, Destination, Location,
    NewBackupRecord,
};
