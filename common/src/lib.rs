pub mod color;
pub mod config;
pub mod dimmer;
pub mod fan;
pub mod kv;
pub mod light;
pub mod link;
pub mod packet;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{DeviceConfig, DimmerConfig, NetworkConfig, RuntimeConfig};
pub use dimmer::{ControlRequest, Dimmer};
pub use kv::{KeyValueStore, MemoryStore};
pub use link::{
    event_channel, BtTransport, Clock, LinkEvent, ScanOutcome, SystemClock, TransportEventSink,
    TransportEvents,
};
pub use packet::{Command, CommandType, PacketError};
pub use store::ConfigStore;
pub use types::{
    ConnectionState, DimmerStatus, DiscoveredDevice, FanSpeed, LightMode, MacAddress,
};
