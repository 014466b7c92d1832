mod activation;
mod node;
mod state;

pub use node::PreferenceNode;
pub use state::VersionedNodeState;

pub(crate) use node::NodeInner;
pub(crate) use state::decode_properties;
pub(crate) use state::property_diff;
