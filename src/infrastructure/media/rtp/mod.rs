//! RTP (Real-time Transport Protocol) Implementation
//!
//! This module implements the RFC 3550 media path for a call: the packet
//! codec, the paced per-call handler and the shared port allocator.

pub mod handler;
pub mod packet;
pub mod port_allocator;

pub use handler::{RtpHandler, RtpHandlerConfig, RtpStats};
pub use packet::{RtpError, RtpPacket};
pub use port_allocator::{AllocatorError, MemoryPortStore, PortAllocator, PortStore};
