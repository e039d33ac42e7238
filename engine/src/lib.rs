pub mod dump;
pub mod executor;
pub mod parallel;
pub mod pgpass;
pub mod rotation;
pub mod scheduler;

pub use dump::{DumpProducer, DumpRequest, PgDump};
pub use executor::{BackupExecutor, DatabaseResult};
pub use parallel::{RunReport, backup_all_databases};
pub use rotation::{BackupFile, RotationReport};
pub use scheduler::{TierSchedule, check_schedule, compute_schedule};
