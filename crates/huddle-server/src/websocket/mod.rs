//! WebSocket connections: per-connection state, socket pumps, visibility
//! filtering, request routing, and the connection hub.

pub mod connection;
pub mod filter;
pub mod hub;
pub mod outbound;
pub mod pump;
pub mod router;
pub mod session_state;
pub mod transport;

pub use connection::{ConnectionChannels, WebConn};
pub use filter::VisibilityFilter;
pub use hub::{BroadcastReport, Collaborators, Hub};
pub use outbound::{DropPolicy, EnqueueOutcome, Outbound, OutboundQueue};
pub use pump::PumpStrategy;
pub use router::{ActionContext, ActionHandler, ActionRouter};
pub use session_state::{SessionSnapshot, SessionState};
pub use transport::{Frame, MemoryPeer, Transport, TransportError, memory_pair};
