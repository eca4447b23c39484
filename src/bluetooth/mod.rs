pub mod bluez;
pub mod scanner;
pub mod transport;

pub use bluez::BluezTransport;
pub use scanner::{connect_all, discover, ConnectFailure, ConnectReport};
pub use transport::{NotificationStream, Transport};
