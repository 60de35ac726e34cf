pub mod dispatch;
pub mod gateway;
pub mod images;
pub mod imgsize;
pub mod limiter;
pub mod media;
pub mod queue;
pub mod rate_limit;
pub mod reconnect;
pub mod rest;
pub mod seq;
pub mod stream;
pub mod token;
pub mod wire;

pub use dispatch::OutboundDispatcher;
pub use gateway::AccountGateway;
pub use limiter::{ReplyDecision, ReplyLimiter};
pub use queue::InboundQueue;
pub use seq::MsgSeqCounter;
pub use token::TokenStore;
