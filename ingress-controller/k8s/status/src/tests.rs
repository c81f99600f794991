mod controller;
mod index;

use ingress_controller_core::{ConditionType, ObjectKey, StatusResult};

fn valid(name: &str) -> StatusResult {
    StatusResult::new(ObjectKey::http_proxy("app", name), Some(1))
}

fn invalid(name: &str) -> StatusResult {
    let mut result = valid(name);
    result.add_error(ConditionType::Service, "ServiceUnresolvedReference", "not found");
    result
}
