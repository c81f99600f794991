use crate::{
    core::{Leadership, ResourceId},
    grpc::{metrics::DiscoveryMetrics, DiscoveryServer},
    index::{self, Debounce, ObjectStore, Scheduler},
    index_list::IndexList,
    k8s::{self, Client, Resource},
    lease, status, xds,
};
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

// The maximum number of status patches to buffer. Each rebuild emits at most
// one update per root object, so this bounds the number of objects whose
// status may be pending at once.
const STATUS_UPDATE_QUEUE_SIZE: usize = 10_000;

const FIELD_MANAGER: &str = "ingress-controller";

#[derive(Debug, Parser)]
#[clap(name = "ingress-controller", about = "An Envoy ingress control plane")]
pub struct Args {
    #[clap(
        long,
        default_value = "ingress_controller=info,warn",
        env = "INGRESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The address on which Envoy discovery requests are served.
    #[clap(long, default_value = "0.0.0.0:8001")]
    xds_addr: SocketAddr,

    /// The port of the proxy's plaintext listener.
    #[clap(long, default_value = "8080")]
    http_port: u16,

    /// The port of the proxy's TLS listener.
    #[clap(long, default_value = "8443")]
    https_port: u16,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    /// Only configuration objects of this ingress class are served.
    ///
    /// When unset, objects without a class or with the `contour` class are
    /// served.
    #[clap(long)]
    ingress_class_name: Option<String>,

    /// Namespaces in which root HTTPProxies are accepted. All namespaces when
    /// unset.
    #[clap(long, value_delimiter = ',')]
    root_namespaces: Vec<String>,

    /// The `namespace/name` of the certificate served to clients without SNI.
    #[clap(long)]
    fallback_certificate: Option<SecretRef>,

    /// Ignores requests to serve routes over plaintext alongside TLS.
    #[clap(long)]
    disable_permit_insecure: bool,

    #[clap(long, default_value = "100")]
    holdoff_delay_ms: u64,

    #[clap(long, default_value = "500")]
    holdoff_max_delay_ms: u64,

    /// The timeout for establishing upstream connections.
    #[clap(long, default_value = "2000")]
    connect_timeout_ms: u64,

    /// Assumes leadership without claiming the write lease.
    #[clap(long)]
    leader_election_disabled: bool,

    #[clap(long, default_value = "projectcontour")]
    leader_election_namespace: String,

    #[clap(long, default_value = "contour")]
    controller_deployment_name: String,

    #[clap(long, default_value = "5000")]
    status_patch_timeout_ms: u64,

    /// Never writes the status of configuration objects.
    #[clap(long)]
    status_update_disabled: bool,
}

/// A `namespace/name` secret reference.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SecretRef(ResourceId);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            xds_addr,
            http_port,
            https_port,
            cluster_domain,
            ingress_class_name,
            root_namespaces,
            fallback_certificate,
            disable_permit_insecure,
            holdoff_delay_ms,
            holdoff_max_delay_ms,
            connect_timeout_ms,
            leader_election_disabled,
            leader_election_namespace,
            controller_deployment_name,
            status_patch_timeout_ms,
            status_update_disabled,
        } = self;

        let builder = index::Builder::new(index::Config {
            cluster_domain,
            http_port,
            https_port,
            fallback_certificate: fallback_certificate.map(|SecretRef(id)| id),
            root_namespaces,
            disable_permit_insecure,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        });
        let debounce = Debounce::new(
            Duration::from_millis(holdoff_delay_ms),
            Duration::from_millis(holdoff_max_delay_ms),
        );

        let mut prom = <Registry>::default();
        let status_registry = prom.sub_registry_with_prefix("status");
        let status_metrics = status::ControllerMetrics::register(status_registry);
        let status_index_metrics = status::IndexMetrics::register(status_registry);
        let rebuild_metrics =
            index::RebuildMetrics::register(prom.sub_registry_with_prefix("rebuild"));
        let cache_metrics =
            xds::CacheMetrics::register(prom.sub_registry_with_prefix("xds_cache"));
        let grpc_metrics =
            DiscoveryMetrics::register(prom.sub_registry_with_prefix("discovery"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let leadership = if leader_election_disabled {
            Leadership::fixed(true)
        } else {
            let hostname = std::env::var("HOSTNAME")
                .map_err(|_| anyhow!("Failed to fetch `HOSTNAME` environment variable"))?;
            lease::init(
                &runtime,
                &leader_election_namespace,
                &controller_deployment_name,
                &hostname,
            )
            .await?
        };

        // Build the indexes that hold the objects the routing graph is built
        // from, and the endpoint cache that bypasses the graph entirely.
        let store = ObjectStore::new(ingress_class_name).shared();
        let endpoints = xds::EndpointCache::shared(&cache_metrics);
        let caches = xds::Caches::new(&cache_metrics, &endpoints.read());

        let mut scheduler = Scheduler::new(
            store.clone(),
            builder,
            debounce,
            leadership.clone(),
            rebuild_metrics,
        )
        .observe(Arc::new(caches.secrets.clone()))
        .observe(Arc::new(caches.clusters.clone()))
        .observe(Arc::new(caches.routes.clone()))
        .observe(Arc::new(caches.listeners.clone()));

        let status_index = if status_update_disabled {
            info!("Status updates are disabled");
            None
        } else {
            let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
            let status_index =
                status::Index::shared(leadership.clone(), updates_tx, status_index_metrics);
            scheduler = scheduler.with_status_sink(Arc::new(status::IndexSink::new(
                status_index.clone(),
            )));

            let controller = status::Controller::new(
                status::KubeWriter::new(runtime.client(), FIELD_MANAGER),
                leadership,
                updates_rx,
                Duration::from_millis(status_patch_timeout_ms),
                status_metrics,
            )
            .with_index(status_index.clone());
            tokio::spawn(controller.run().instrument(info_span!("status_controller")));
            Some(status_index)
        };

        // Spawn resource watches.

        let ingresses = runtime.watch_all::<k8s::Ingress>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(store.clone(), ingresses)
                .instrument(info_span!("ingresses")),
        );

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(store.clone(), services).instrument(info_span!("services")),
        );

        let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(store.clone(), secrets).instrument(info_span!("secrets")),
        );

        let endpoints_watch = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(endpoints, endpoints_watch)
                .instrument(info_span!("endpoints")),
        );

        if api_resource_exists::<k8s::HttpProxy>(&runtime.client()).await {
            let proxies = runtime.watch_all::<k8s::HttpProxy>(watcher::Config::default());
            match status_index.clone() {
                Some(status_index) => tokio::spawn(
                    kubert::index::namespaced(
                        IndexList::<_, ()>::new(store.clone()).push(status_index).shared(),
                        proxies,
                    )
                    .instrument(info_span!("httpproxies")),
                ),
                None => tokio::spawn(
                    kubert::index::namespaced(store.clone(), proxies)
                        .instrument(info_span!("httpproxies")),
                ),
            };
        } else {
            tracing::warn!("httpproxies.projectcontour.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<k8s::ExtensionService>(&runtime.client()).await {
            let extensions = runtime.watch_all::<k8s::ExtensionService>(watcher::Config::default());
            match status_index {
                Some(status_index) => tokio::spawn(
                    kubert::index::namespaced(
                        IndexList::<_, ()>::new(store.clone()).push(status_index).shared(),
                        extensions,
                    )
                    .instrument(info_span!("extensionservices")),
                ),
                None => tokio::spawn(
                    kubert::index::namespaced(store.clone(), extensions)
                        .instrument(info_span!("extensionservices")),
                ),
            };
        } else {
            tracing::warn!(
                "extensionservices.projectcontour.io resource kind not found, skipping watches"
            );
        }

        if api_resource_exists::<k8s::TlsCertificateDelegation>(&runtime.client()).await {
            let delegations =
                runtime.watch_all::<k8s::TlsCertificateDelegation>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(store.clone(), delegations)
                    .instrument(info_span!("tlscertificatedelegations")),
            );
        } else {
            tracing::warn!(
                "tlscertificatedelegations.projectcontour.io resource kind not found, skipping watches"
            );
        }

        tokio::spawn(
            scheduler
                .run(runtime.shutdown_handle())
                .instrument(info_span!("scheduler")),
        );

        // Serve discovery requests from the caches until shutdown.
        let server = DiscoveryServer::new(caches, grpc_metrics, runtime.shutdown_handle());
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            if let Err(error) = grpc(xds_addr, server, drain).await {
                tracing::error!(%error, "Discovery server failed");
            }
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

// === impl SecretRef ===

impl std::str::FromStr for SecretRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self(ResourceId::new(ns, name)))
            }
            _ => bail!("invalid secret reference {s:?}: expected namespace/name"),
        }
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(addr: SocketAddr, server: DiscoveryServer, drain: drain::Watch) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(server.clone().aggregated_svc())
            .add_service(server.clone().cluster_svc())
            .add_service(server.clone().endpoint_svc())
            .add_service(server.clone().listener_svc())
            .add_service(server.clone().route_svc())
            .add_service(server.secret_svc())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
