//! Local presence plumbing for the Airlift engine.
//!
//! Two independent discovery paths feed the engine: mDNS service
//! announce/browse on the local network, and an opaque short-range radio
//! advertisement whose byte format is fixed by the interoperating
//! protocol. This crate owns both codecs plus network-interface probing.

pub mod advert;
pub mod announce;
pub mod browse;
pub mod model;
pub mod net;

pub use advert::{Advertisement, AdvertError};
pub use announce::Announcer;
pub use browse::{Browser, SightingEvent};
pub use model::{InterfaceIp, ServiceAnnouncement, Sighting, TxtRecord};
