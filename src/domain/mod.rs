//! Domain models - core business types shared across the gateway
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - register/parameter/bus shapes, error codes, the outbound envelope
//! - `codec` - address normalization and register decoding

pub mod codec;
pub mod types;

// Re-export commonly used types at module level
pub use types::{
    BusKind, BusSpec, DataType, ErrorCode, Envelope, NodeSpec, ParamMode, ParamSpec, PublishMode,
    RegisterType, Trigger, WordOrder,
};
