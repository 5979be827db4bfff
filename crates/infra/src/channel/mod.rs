//! Outbound channel access: credit-aware client, transport and adapters.
//!
//! ## Layers
//!
//! - `ChannelAdapter`: per-channel request shaping and response parsing
//! - `RateLimitedClient`: credit telemetry, backoff and fail-fast per connection
//! - `ChannelTransport`: the wire (`HttpTransport` in production)

pub mod adapter;
pub mod adapters;
pub mod client;
pub mod credit;
pub mod transport;

pub use adapter::{
    AdapterError, AdapterRegistry, BookingPage, ChannelAdapter, ChannelBooking, ChannelType,
    DaySnapshot, PullMode, PushSnapshot, RejectedBooking, RoomSnapshot,
};
pub use client::{ChannelError, RateLimitError, RateLimitedClient};
pub use credit::{BackoffConfigError, BackoffTier, BackoffTiers, CreditState};
pub use transport::{
    ChannelRequest, ChannelResponse, ChannelTransport, HttpMethod, HttpTransport, TransportError,
};
