//! pva-transport: the session layer: channel search, the transport
//! registry and connector, and the TCP transport itself.

pub mod acceptor;
pub mod beacon;
pub mod connector;
pub mod context;
pub mod error;
pub mod registry;
pub mod search;
pub mod transport;

pub use acceptor::Acceptor;
pub use beacon::{BeaconEvent, BeaconTracker};
pub use connector::Connector;
pub use context::{ClientContext, Located};
pub use error::{ConnectError, TransportError};
pub use registry::{Reservation, TransportKey, TransportRegistry};
pub use search::{ChannelDirectory, DatagramSink, SearchInstance, SearchManager, SearchTargets};
pub use transport::{
    IgnoreMessages, MessageHandler, OwnerId, Role, Transport, TransportOwner, TransportSender,
    TransportState,
};
