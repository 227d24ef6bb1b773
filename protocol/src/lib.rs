//! Data shapes exchanged between the herd supervisor core and whatever front
//! end exposes it (the stdio CLI today).

pub mod contact;
pub mod instance;
pub mod request;
pub mod session;

pub use contact::ContactRecord;
pub use instance::InstanceSnapshot;
pub use request::HerdRequest;
pub use request::HerdResponse;
pub use request::ResponseData;
pub use session::SessionState;

/// Sentinel id for an instance without a live process.
pub const NO_PROCESS_ID: i32 = -1;
