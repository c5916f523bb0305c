//! UDP transport for packets.
//!
//! Each direction owns one socket:
//!
//! - **Egress** ([`egress`]): fragments encoded frames and writes one
//!   datagram per fragment to a fixed destination.
//!
//! - **Ingress** ([`ingress`]): a blocking receive loop decodes datagrams
//!   into an [`IntakeQueue`], where each packet lives for at most the
//!   configured TTL before consumers pull it out.
//!
//! Socket setup (buffer sizes, read timeout) lives in [`udp`].

pub mod egress;
pub mod ingress;
pub mod intake;
pub mod udp;

pub use egress::{PacketEgress, SendReport};
pub use ingress::{IngressStats, PacketIngress};
pub use intake::IntakeQueue;
