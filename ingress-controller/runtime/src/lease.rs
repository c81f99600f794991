use crate::{
    core::Leadership,
    k8s::{self, Resource},
};
use anyhow::{anyhow, Result};
use k8s_openapi::api::{apps::v1::Deployment, coordination::v1 as coordv1};
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::Instrument;

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "ingress-controller-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Claims the write lease and reports whether this instance holds it.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<Leadership> {
    // The lease is owned by the controller's Deployment so that it is removed
    // along with it.
    let api = k8s::Api::<Deployment>::namespaced(runtime.client(), ns);
    let deployment = api.get(deployment_name).await?;
    let owner = deployment
        .controller_owner_ref(&())
        .ok_or_else(|| anyhow!("deployment {ns}/{deployment_name} has no uid"))?;

    let lease = coordv1::Lease {
        metadata: k8s::ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [(
                    "app.kubernetes.io/component".to_string(),
                    "ingress-controller".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            LEASE_NAME,
            &k8s::PatchParams {
                field_manager: Some("ingress-controller".to_string()),
                ..Default::default()
            },
            &k8s::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;

    let (tx, leadership) = Leadership::channel(claims.borrow().is_current_for(hostname));
    tokio::spawn(
        track(claims, hostname.to_string(), tx)
            .instrument(tracing::info_span!("lease", name = LEASE_NAME)),
    );
    Ok(leadership)
}

/// Publishes whether `hostname` holds each new claim, until the claims or
/// every leadership handle are dropped.
async fn track(
    mut claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: String,
    tx: watch::Sender<bool>,
) {
    loop {
        let leader = claims.borrow_and_update().is_current_for(&hostname);
        let changed = tx.send_if_modified(|current| {
            if *current == leader {
                return false;
            }
            *current = leader;
            true
        });
        if changed {
            tracing::info!(leader, "Leadership changed");
        }

        tokio::select! {
            res = claims.changed() => {
                if res.is_err() {
                    return;
                }
            }
            _ = tx.closed() => return,
        }
    }
}
