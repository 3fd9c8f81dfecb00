pub mod conversations;
pub mod error;
pub mod identity;
pub mod messages;
pub mod ports;
pub mod presence;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
