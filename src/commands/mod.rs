pub mod call_api;
pub mod util_api;

pub use call_api::CallHandle;
pub use util_api::{
    check_ice_server_availability, default_ice_servers, new_participant_id, validate_ice_servers,
};
