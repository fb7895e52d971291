pub mod mexc_rest;

pub use mexc_rest::MexcClient;
