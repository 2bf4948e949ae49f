//! Call-center aggregation engine: keeps an authenticated session with the
//! switch's manager interface, folds its events into queue and agent
//! statistics, and pushes every change to connected dashboards.

pub mod config;
pub mod hub;
pub mod logging;
pub mod normalizer;
pub mod probe;
pub mod session;
pub mod store;
pub mod switchboard;
pub mod transport;

pub use hub::{BroadcastHub, HubConfig};
pub use probe::{ConnectivityProbe, DiagnosticReport, ProbeConfig};
pub use session::{ProtocolSession, SessionConfig, SessionError, SessionSignal};
pub use store::{AggregateStateStore, StoreConfig, StoreUpdate};
pub use switchboard::{CommandError, Switchboard, SwitchboardConfig};
pub use transport::{AmiTransport, ManagerLink, ManagerTransport};
