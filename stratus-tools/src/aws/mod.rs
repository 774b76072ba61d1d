//! AWS operation handlers.

mod call;
mod costs;

pub use call::ApiCallOperation;
pub use costs::{estimate_cost, monthly_instance_cost};
