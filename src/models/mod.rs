pub mod record;
pub mod request;

pub use record::{CachedResponse, IdempotencyRecord};
pub use request::{BodyArgument, IdempotentRequest, RouteDescriptor};
