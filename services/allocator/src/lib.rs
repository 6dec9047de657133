//! devlease allocator
//!
//! Leases an exclusive session on a device from a shared device farm for the
//! duration of a CI build. When no device carries the requested build image
//! one is flashed first.
//!
//! ## Architecture
//!
//! - **Locator**: resolves label filters to a device, shuffled across the pool
//! - **Provisioner**: flashes a device by running the flash project
//! - **Sessions**: locks a device and waits for the session to run
//! - **Proxies**: waits for the ADB and Marionette proxies of a session
//! - **Orchestrator**: drives the above under one retry budget and hands
//!   back a [`Lease`] whose teardown releases the session

pub mod cancel;
pub mod config;
pub mod error;
pub mod filter;
pub mod locator;
pub mod logging;
pub mod macros;
pub mod orchestrator;
pub mod provision;
pub mod proxy;
pub mod redact;
pub mod session;
pub mod snapshot;

pub use cancel::{cancellation, CancelHandle, Cancellation, Cancelled};
pub use config::{AllocationRequest, AllocatorConfig};
pub use error::{AllocError, ProxyError};
pub use filter::DeviceFilter;
pub use orchestrator::{
    env_map, Lease, Orchestrator, Phase, SessionDescriptor, Teardown, TeardownOutcome,
};
pub use snapshot::Workspace;
