pub mod api;
pub mod ws;

pub use api::api_routes;
