//! Contains the events and handler traits used to observe server discovery, monitoring and
//! connection pooling.

pub mod cmap;
pub mod sdam;
