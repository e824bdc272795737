pub mod channel;
pub mod m3u;
pub mod proxy;
pub mod stream;

pub use channel::{Channel, ChannelGroup, ChannelProfile, ProfileChannel};
pub use m3u::{M3uAccount, PriorityMode, UrlRewrite};
pub use proxy::{parse_proxy_status, ProxyChannelStatus};
pub use stream::{ProbeStatus, Stream, StreamStats};
