//! P4Runtime-style control-plane session manager daemon.
//!
//! The daemon establishes authoritative control over a set of
//! forwarding devices and holds it until interrupted:
//!
//! 1. Load and validate startup artifacts ([`config`])
//! 2. Open one session per device and arbitrate mastership
//!    concurrently ([`session`], [`controller`])
//! 3. Push the forwarding pipeline to every primary session
//! 4. Install each device's rule batch, defaults before keyed entries
//! 5. Hold the channels in steady state until shutdown
//!
//! The wire protocol lives behind the [`transport`] seam; the
//! in-process [`emulated`] switch implements it for the daemon and
//! the test suite.

pub mod config;
pub mod controller;
pub mod diag;
pub mod emulated;
pub mod session;
pub mod transport;

// Re-export commonly used items at crate root
pub use config::{DaemonConfig, DeviceConfig, ThresholdRule};
pub use controller::{Controller, DeviceReport, RunSummary, Stage};
pub use emulated::{EmulatedSwitch, EmulatedTransport};
pub use session::{BatchReport, DeviceSession};
pub use transport::{DeviceChannel, DeviceTransport, RpcError};
