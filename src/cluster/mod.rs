mod configuration;
mod member;

pub use configuration::ClusterConfiguration;
pub use member::Member;
