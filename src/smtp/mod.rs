//! SMTP protocol support: the wire-level stream wrapper shared by both
//! sides (`transport`), the accepting side (`server`), and the
//! originating side (`client`), per spec.md §4.2/§4.3.

pub mod client;
pub mod server;
pub mod transport;
