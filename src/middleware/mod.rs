pub mod actor;
pub mod cors;
pub mod validation;

pub use actor::require_actor;
pub use cors::create_cors_layer;
pub use validation::validate_json;
