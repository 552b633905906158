//! Packet capture: the external packet-source adapter and the traffic
//! segmenter that reconstructs application-layer media segments from raw
//! TCP payload sizes.

pub mod packet_source;
pub mod segmenter;
