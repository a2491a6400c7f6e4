//! Call control for the tandem telephony stack
//!
//! The connection phase machine, the call container bridging media
//! between connections, the per-protocol endpoint factories, the manager
//! coordinating all of it, and the regex routing engine translating
//! symbolic parties to concrete endpoints.

pub mod call;
pub mod connection;
pub mod endpoint;
pub mod endpoints;
pub mod error;
pub mod manager;
pub mod options;
pub mod phase;
pub mod routing;
pub mod token;

pub use call::Call;
pub use connection::{
    session_id_for, Connection, JitterSettings, PartyInfo, UserInput, RFC2833_PAYLOAD_TYPE,
};
pub use endpoint::{Endpoint, EndpointCore, ProductInfo};
pub use endpoints::{
    LocalEndpoint, LocalEndpointConfig, MixerEndpoint, MixerNode, NetworkEndpoint,
    NetworkEndpointConfig,
};
pub use error::{CallEndReason, Error, Result};
pub use manager::{CallObserver, Manager, ManagerConfig, MediaObserver};
pub use options::{
    parse_auto_start, parse_silence_mode, AutoStartDirection, AutoStartMap, StringOptions,
    UserInputMode,
};
pub use phase::{Phase, PhaseState};
pub use routing::{split_scheme, RouteEntry, RouteTable};
pub use token::TokenGenerator;
