//! Frame forwarding between peer ports: a learning ethernet switch and a
//! longest-prefix-match IP router, each running as its own actor.

pub mod ethernet;
pub mod ip;
mod port;
pub mod router;
pub mod switch;

pub use port::{Gatherer, Group, Port, PortIndex};
pub use router::Router;
pub use switch::{RoutingMethod, Switch, SwitchConfig};
