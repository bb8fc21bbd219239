//! Stats subscription and fan-out.

mod hub;
mod types;

pub use hub::StatsHub;
pub use types::{Delivery, GetStatsRequest, StatEvent, Subscription, endpoint_token, route_event};
