pub mod lease;
pub mod proxy;
pub mod request;

pub use lease::*;
pub use proxy::*;
pub use request::*;
