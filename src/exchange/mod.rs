pub mod traits;

pub use traits::ExchangeGateway;
