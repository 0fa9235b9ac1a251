pub mod json;
pub mod plain;

pub use json::{output_interval_json, output_json, save_json};
pub use plain::{output_interval_plain, output_plain, output_server_event};
