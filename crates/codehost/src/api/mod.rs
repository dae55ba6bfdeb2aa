//! Admission surface: thin HTTP wrappers over the store, the allocator and
//! the runtime driver.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult};
pub use handlers::{ReportResponse, StartRequest, StartResponse};
pub use routes::{OPERATOR_KEY_HEADER, create_router};
pub use state::{AdmissionSettings, AppState};
