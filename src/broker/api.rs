//! Public API for the broker consumer
//!
//! External modules should import from here rather than from the internal
//! modules.

// Engine and lifecycle
pub use crate::broker::engine::{ConsumerEngine, WORKER_TYPE};
pub use crate::core::shutdown::{EngineState, ShutdownCoordinator, ShutdownSignal};

// Registration
pub use crate::broker::handler::{
    AckMode, EventContext, HandlerEntry, HandlerError, HandlerGroup, HandlerOptions, HandlerResult,
    MessageHandler, QueueBinding,
};

// Transport seam
pub use crate::broker::delivery::{AckHandle, Acknowledger, Delivery, DeliveryEnvelope, DeliveryStream};
pub use crate::broker::memory::{MemoryTransport, Settlement};
pub use crate::broker::transport::{QueueHandle, Transport};

// Building blocks
pub use crate::broker::gate::{AdmissionGate, GatePermit, Reservation};
pub use crate::broker::multiplexer::{Multiplexer, Ready};
pub use crate::broker::processor::{
    correlation_id, AckOutcome, ConsumeRecord, MessageProcessor, ProcessOutcome, RECORD_TARGET,
    REQUEST_ID_HEADERS,
};
pub use crate::broker::stats::{ConsumerStatistics, EngineStats};

// Error handling
pub use crate::broker::error::{
    EngineError, EngineResult, HandlerFailure, TransportError, TransportResult,
};
