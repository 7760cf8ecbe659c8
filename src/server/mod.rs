pub mod http;

pub use http::ChatHttpServer;
