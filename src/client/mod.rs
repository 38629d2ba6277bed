pub mod params;
pub mod session;
pub mod transport;
pub mod url;

pub use params::{MultipartField, Payload};
pub use session::HttpSession;
pub use transport::{
    ReqwestTransport, ReqwestTransportFactory, Transport, TransportFactory, TransportRequest,
    TransportResponse, TransportSettings,
};
