//! The network model: addresses, layered packets and the builders that create them, and the
//! links that carry packets between interfaces.

pub mod address;
pub mod builder;
pub mod headers;
pub mod link;
pub mod packet;
