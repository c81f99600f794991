use ingress_controller_core::{status::SubCondition, CurrentStatus, ObjectKind, StatusResult};
use ingress_controller_k8s_api::{
    self as k8s, DetailedCondition, ExtensionService, ExtensionServiceStatus, HttpProxy,
    HttpProxyStatus, ResourceExt,
};
use kube::core::NamespaceResourceScope;
use serde::de::DeserializeOwned;
use std::{fmt::Debug, future::Future};

/// The condition type owned by this controller.
pub(crate) const VALID_CONDITION: &str = "Valid";

/// Writes status results to their objects.
pub trait StatusWriter: Send + Sync + 'static {
    fn write(&self, result: &StatusResult) -> impl Future<Output = Result<(), WriteError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("object not found")]
    NotFound,

    #[error("object was modified concurrently")]
    Conflict,

    #[error(transparent)]
    Kube(#[from] Box<k8s::Error>),
}

/// Patches the `status` subresource through the Kubernetes API.
#[derive(Clone)]
pub struct KubeWriter {
    client: k8s::Client,
    params: k8s::PatchParams,
}

/// A resource whose status carries the Valid condition.
trait StatusTarget:
    kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn status(&self, result: &StatusResult, now: &str) -> serde_json::Value;
}

// === impl KubeWriter ===

impl KubeWriter {
    pub fn new(client: k8s::Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            params: k8s::PatchParams {
                field_manager: Some(field_manager.into()),
                ..Default::default()
            },
        }
    }

    async fn patch<T: StatusTarget>(&self, result: &StatusResult) -> Result<(), WriteError> {
        let id = &result.key.id;
        let api = k8s::Api::<T>::namespaced(self.client.clone(), &id.namespace);
        let current = api
            .get_opt(&id.name)
            .await
            .map_err(WriteError::from_kube)?
            .ok_or(WriteError::NotFound)?;

        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        // The resource version makes the API server reject the patch if the
        // object changed since it was read.
        let patch = k8s::Patch::Merge(serde_json::json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "status": current.status(result, &now),
        }));
        api.patch_status(&id.name, &self.params, &patch)
            .await
            .map_err(WriteError::from_kube)?;
        Ok(())
    }
}

impl StatusWriter for KubeWriter {
    async fn write(&self, result: &StatusResult) -> Result<(), WriteError> {
        match result.key.kind {
            ObjectKind::HttpProxy => self.patch::<HttpProxy>(result).await,
            ObjectKind::ExtensionService => self.patch::<ExtensionService>(result).await,
            kind => {
                tracing::debug!(%kind, "Status is not written for this kind");
                Ok(())
            }
        }
    }
}

// === impl WriteError ===

impl WriteError {
    fn from_kube(error: k8s::Error) -> Self {
        match &error {
            k8s::Error::Api(response) if response.code == 404 => Self::NotFound,
            k8s::Error::Api(response) if response.code == 409 => Self::Conflict,
            _ => Self::Kube(Box::new(error)),
        }
    }
}

// === impl StatusTarget ===

impl StatusTarget for HttpProxy {
    fn status(&self, result: &StatusResult, now: &str) -> serde_json::Value {
        let existing = self.status.clone().unwrap_or_default();
        let status = http_proxy_status(existing, result, now);
        serde_json::to_value(status).unwrap_or_default()
    }
}

impl StatusTarget for ExtensionService {
    fn status(&self, result: &StatusResult, now: &str) -> serde_json::Value {
        let existing = self.status.clone().unwrap_or_default();
        let status = ExtensionServiceStatus {
            conditions: merge_conditions(&existing.conditions, result, now),
        };
        serde_json::to_value(status).unwrap_or_default()
    }
}

/// Updates an HTTPProxy status with a result, preserving the fields this
/// controller does not own.
pub(crate) fn http_proxy_status(
    existing: HttpProxyStatus,
    result: &StatusResult,
    now: &str,
) -> HttpProxyStatus {
    HttpProxyStatus {
        current_status: Some(result.current.to_string()),
        description: Some(result.description.clone()),
        conditions: merge_conditions(&existing.conditions, result, now),
        load_balancer: existing.load_balancer,
    }
}

/// Replaces the Valid condition and keeps all others.
///
/// The transition time only moves when the condition's status changes.
pub(crate) fn merge_conditions(
    existing: &[DetailedCondition],
    result: &StatusResult,
    now: &str,
) -> Vec<DetailedCondition> {
    let previous = existing.iter().find(|c| c.condition_type == VALID_CONDITION);
    let valid = valid_condition(result, previous, now);

    let mut conditions = Vec::with_capacity(existing.len() + 1);
    conditions.push(valid);
    conditions.extend(
        existing
            .iter()
            .filter(|c| c.condition_type != VALID_CONDITION)
            .cloned(),
    );
    conditions
}

fn valid_condition(
    result: &StatusResult,
    previous: Option<&DetailedCondition>,
    now: &str,
) -> DetailedCondition {
    let (status, reason) = match result.current {
        CurrentStatus::Valid => ("True", "Valid"),
        CurrentStatus::Invalid => ("False", "ErrorPresent"),
        CurrentStatus::Orphaned => ("False", "Orphaned"),
    };
    let last_transition_time = match previous {
        Some(previous) if previous.status == status => previous
            .last_transition_time
            .clone()
            .or_else(|| Some(now.to_string())),
        _ => Some(now.to_string()),
    };

    DetailedCondition {
        condition_type: VALID_CONDITION.to_string(),
        status: status.to_string(),
        observed_generation: result.generation,
        last_transition_time,
        reason: reason.to_string(),
        message: result.description.clone(),
        errors: result.errors.iter().map(sub_condition).collect(),
        warnings: result.warnings.iter().map(sub_condition).collect(),
    }
}

fn sub_condition(c: &SubCondition) -> k8s::SubCondition {
    k8s::SubCondition {
        condition_type: c.condition_type.to_string(),
        reason: c.reason.clone(),
        message: c.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::{ConditionType, ObjectKey};
    use pretty_assertions::assert_eq;

    const EARLIER: &str = "2024-01-01T00:00:00Z";
    const NOW: &str = "2024-06-01T00:00:00Z";

    fn condition(condition_type: &str, status: &str) -> DetailedCondition {
        DetailedCondition {
            condition_type: condition_type.to_string(),
            status: status.to_string(),
            last_transition_time: Some(EARLIER.to_string()),
            ..Default::default()
        }
    }

    fn invalid() -> StatusResult {
        let mut result = StatusResult::new(ObjectKey::http_proxy("app", "web"), Some(3));
        result.add_error(ConditionType::Tls, "SecretNotValid", "Secret not found: app/cert");
        result
    }

    #[test]
    fn preserves_foreign_status() {
        let existing = HttpProxyStatus {
            conditions: vec![condition("Ready", "True"), condition(VALID_CONDITION, "True")],
            load_balancer: Some(serde_json::json!({ "ingress": [{ "ip": "10.0.0.1" }] })),
            ..Default::default()
        };
        let status = http_proxy_status(existing.clone(), &invalid(), NOW);

        assert_eq!(status.current_status.as_deref(), Some("invalid"));
        assert_eq!(status.load_balancer, existing.load_balancer);
        let types = status
            .conditions
            .iter()
            .map(|c| c.condition_type.as_str())
            .collect::<Vec<_>>();
        assert_eq!(types, vec![VALID_CONDITION, "Ready"]);
        assert_eq!(status.conditions[1], existing.conditions[0]);
    }

    #[test]
    fn describes_errors() {
        let conditions = merge_conditions(&[], &invalid(), NOW);
        assert_eq!(
            conditions,
            vec![DetailedCondition {
                condition_type: VALID_CONDITION.to_string(),
                status: "False".to_string(),
                observed_generation: Some(3),
                last_transition_time: Some(NOW.to_string()),
                reason: "ErrorPresent".to_string(),
                message: "at least one error present, see Errors for details".to_string(),
                errors: vec![k8s::SubCondition {
                    condition_type: "TLSError".to_string(),
                    reason: "SecretNotValid".to_string(),
                    message: "Secret not found: app/cert".to_string(),
                }],
                warnings: vec![],
            }]
        );
    }

    #[test]
    fn transition_time_moves_with_status() {
        let unchanged = merge_conditions(&[condition(VALID_CONDITION, "False")], &invalid(), NOW);
        assert_eq!(unchanged[0].last_transition_time.as_deref(), Some(EARLIER));

        let changed = merge_conditions(&[condition(VALID_CONDITION, "True")], &invalid(), NOW);
        assert_eq!(changed[0].last_transition_time.as_deref(), Some(NOW));
    }

    #[test]
    fn orphaned_proxies() {
        let mut result = StatusResult::new(ObjectKey::http_proxy("app", "leaf"), Some(1));
        result.set_orphaned();
        let status = http_proxy_status(HttpProxyStatus::default(), &result, NOW);
        assert_eq!(status.current_status.as_deref(), Some("orphaned"));
        assert_eq!(status.conditions[0].reason, "Orphaned");
        assert_eq!(status.conditions[0].status, "False");
    }
}
