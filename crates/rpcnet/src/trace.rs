//! Per-category trace verbosity
//!
//! Output goes through `tracing`; these levels only decide whether a category
//! emits its diagnostic messages at all.

use crate::properties::Properties;

pub const NETWORK_CATEGORY: &str = "rpcnet::network";
pub const RETRY_CATEGORY: &str = "rpcnet::retry";
pub const LOCATION_CATEGORY: &str = "rpcobj::location";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceLevels {
    pub network: i64,
    pub retry: i64,
    pub location: i64,
}

impl TraceLevels {
    pub fn from_properties(props: &Properties) -> Self {
        Self {
            network: props.get_property_as_int("Rpc.Trace.Network"),
            retry: props.get_property_as_int("Rpc.Trace.Retry"),
            location: props.get_property_as_int("Rpc.Trace.Location"),
        }
    }
}
