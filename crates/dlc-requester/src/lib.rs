//! dlc-requester: file test runs against the shared pool and collect
//! their logs.
//!
//! ```text
//! let requester = JobRequester::new(store, queues, config, BuildEnv::from_env()).await?;
//! let handle = requester.send_request(image, BuildContext::Pr, 1).await?;
//! let bundle = requester.receive_logs(&handle, Duration::from_secs(3600)).await?;
//! requester.dispose(&handle).await?;
//! ```

pub mod env;
pub mod error;
pub mod requester;

pub use env::BuildEnv;
pub use error::{RequesterError, RequesterResult};
pub use requester::{JobRequester, TicketHandle, TicketStatus};
