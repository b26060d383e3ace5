pub mod api;

pub use api::{app_router, AppState};
