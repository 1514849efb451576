pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gossip;
pub mod handler;
pub mod net;
pub mod node;
pub mod probe;
pub mod ring;
pub mod store;
pub mod types;

pub use cache::ReplyCache;
pub use config::Config;
pub use error::{NetError, ParseError, StoreError};
pub use gossip::GossipState;
pub use node::NodeRuntime;
pub use ring::{Contact, Membership, Peer, Replica, StorePush};
pub use store::{Store, StoreVal};
pub use types::{Key, Uid, node_id, now_millis};
