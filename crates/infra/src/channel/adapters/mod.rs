pub mod channel_manager;
pub mod ota;

pub use channel_manager::ChannelManagerAdapter;
pub use ota::OtaAdapter;
