// =============================================================================
// ZAPLINE v0.4 - Payment Channels
// =============================================================================
//
// Bidirectional payment channels over a shared 2-of-2 funding output.
//
// Layout:
//   state       channel records, engine states, invariants
//   messages    wire codec for the four update messages
//   commitment  commitment transaction construction
//   engine      the update state machine and break path
//   fund        regtest channel record materialization
//
// =============================================================================

pub mod commitment;
pub mod engine;
pub mod fund;
pub mod messages;
pub mod state;

pub use engine::UpdateEngine;
pub use messages::ChannelMessage;
pub use state::{Channel, ChannelError, EngineState, OutPoint, PubKey};
