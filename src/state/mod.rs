pub mod hop;
pub mod identity;

pub use hop::{BorderRecord, Direction, Hop, ProbeSite, TracePath};
pub use identity::{IdentityJournal, IdentityPair, IdentitySink, PathIdentityEncoder, RawPathRecord};
