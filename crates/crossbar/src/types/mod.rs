mod address;
mod gpid;
mod group;
mod uri;

pub use address::{
    decode_redirect_address, encode_redirect_address, RpcAddress, MAX_CLIENT_PORT,
};
pub use gpid::Gpid;
pub use group::GroupAddress;
pub use uri::UriAddress;
