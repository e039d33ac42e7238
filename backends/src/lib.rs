pub mod backblaze;
pub mod backend;
pub mod glob;
pub mod local;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod multi;
pub mod options;
pub mod registry;
pub mod retry;
pub mod s3;
pub mod ssh;

pub use backend::{Backend, BackendType, FileEntry};
pub use local::LocalBackend;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBackend;
pub use multi::{MultiBackend, OperationResult, any_succeeded};
pub use registry::{BackendRegistry, close_all};
pub use retry::{RetryConfig, Retryable, retry_with_backoff};
pub use s3::S3Backend;
pub use ssh::SshBackend;
