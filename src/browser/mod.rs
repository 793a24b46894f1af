pub mod fingerprint;
pub mod remote;

// Re-export common types
pub use fingerprint::{FingerprintManager, CompleteFingerprint};
pub use remote::RemoteBrowserService;
