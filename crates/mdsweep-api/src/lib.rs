// mdsweep-api: Async session client for mobility-manager device APIs.

pub mod error;
pub mod normalize;
pub mod session;
pub mod shell;
pub mod transport;

pub use error::Error;
pub use session::{Credentials, DeviceSession, Endpoint};
pub use transport::{TlsMode, TransportConfig};
