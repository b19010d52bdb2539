mod codec;
mod frame;
mod messages;

pub use codec::decode;
pub use codec::decode_membership;
pub use codec::encode;
pub use codec::encode_membership;
pub use frame::DecodeError;
pub use frame::MessageHeader;
pub use messages::AppendRequest;
pub use messages::AppendResponse;
pub use messages::ConfigureRequest;
pub use messages::ConfigureResponse;
pub use messages::JoinRequest;
pub use messages::LeaveResponse;
pub use messages::Message;
pub use messages::PollRequest;
pub use messages::PollResponse;
pub use messages::VoteRequest;
pub use messages::VoteResponse;
pub use messages::WireEntry;
